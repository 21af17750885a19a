//! Retention rules and enforcement.
//!
//! Rules are evaluated once, when a record is created: the record carries a
//! human-readable policy and an absolute expiry from then on. Enforcement
//! soft-deletes expired records and purges deleted ones after a grace
//! period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::backup::{BackupRecord, BackupStatus, BackupType, UploadStatus};
use crate::models::query::RecordFilter;
use crate::services::metadata_store::MetadataStore;

const DAY: u64 = 24 * 60 * 60;

/// How long an artifact is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Keep {
    Forever,
    For(Duration),
}

impl TryFrom<String> for Keep {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("forever") {
            return Ok(Keep::Forever);
        }
        let duration = humantime::parse_duration(trimmed)
            .map_err(|e| format!("invalid retention '{}': {}", trimmed, e))?;
        if duration.is_zero() {
            return Err("retention must be longer than zero; use 'forever' to keep".into());
        }
        Ok(Keep::For(duration))
    }
}

impl From<Keep> for String {
    fn from(keep: Keep) -> Self {
        match keep {
            Keep::Forever => "forever".to_string(),
            Keep::For(duration) => humantime::format_duration(duration).to_string(),
        }
    }
}

/// Storage and retention settings for one backup type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetentionRule {
    pub local_enabled: bool,
    pub remote_enabled: bool,
    pub keep: Keep,
}

impl RetentionRule {
    pub fn default_for(backup_type: BackupType) -> Self {
        let keep = match backup_type {
            BackupType::Hourly => Keep::For(Duration::from_secs(2 * DAY)),
            BackupType::Daily => Keep::For(Duration::from_secs(7 * DAY)),
            BackupType::Weekly => Keep::For(Duration::from_secs(30 * DAY)),
            BackupType::Monthly => Keep::For(Duration::from_secs(365 * DAY)),
            BackupType::Yearly | BackupType::Manual => Keep::Forever,
        };
        Self {
            local_enabled: true,
            remote_enabled: false,
            keep,
        }
    }
}

/// Partial rule as written in the YAML file; unset fields keep the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RuleOverride {
    local_enabled: Option<bool>,
    remote_enabled: Option<bool>,
    keep: Option<Keep>,
}

/// Retention rules for every backup type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    rules: BTreeMap<BackupType, RetentionRule>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            rules: BackupType::ALL
                .iter()
                .map(|t| (*t, RetentionRule::default_for(*t)))
                .collect(),
        }
    }
}

impl RetentionConfig {
    /// Parse YAML of the form
    ///
    /// ```yaml
    /// daily:
    ///   keep: 14d
    ///   remote_enabled: true
    /// yearly:
    ///   keep: forever
    /// ```
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let overrides: BTreeMap<BackupType, RuleOverride> = serde_yaml::from_str(yaml)?;
        let mut config = Self::default();
        for (backup_type, o) in overrides {
            let rule = config
                .rules
                .entry(backup_type)
                .or_insert_with(|| RetentionRule::default_for(backup_type));
            if let Some(v) = o.local_enabled {
                rule.local_enabled = v;
            }
            if let Some(v) = o.remote_enabled {
                rule.remote_enabled = v;
            }
            if let Some(v) = o.keep {
                rule.keep = v;
            }
            if !rule.local_enabled && !rule.remote_enabled {
                return Err(AppError::Config(format!(
                    "{} backups must be stored locally, remotely or both",
                    backup_type
                )));
            }
        }
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Config(format!(
                "cannot read retention config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn set_rule(&mut self, backup_type: BackupType, rule: RetentionRule) {
        self.rules.insert(backup_type, rule);
    }

    pub fn rule(&self, backup_type: BackupType) -> RetentionRule {
        self.rules
            .get(&backup_type)
            .copied()
            .unwrap_or_else(|| RetentionRule::default_for(backup_type))
    }

    /// Human-readable policy stored on the record.
    pub fn describe(&self, backup_type: BackupType) -> String {
        match self.rule(backup_type).keep {
            Keep::Forever => "keep forever".to_string(),
            Keep::For(d) => format!("keep {}", humantime::format_duration(d)),
        }
    }

    pub fn expires_at(
        &self,
        backup_type: BackupType,
        created_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self.rule(backup_type).keep {
            Keep::Forever => None,
            Keep::For(d) => chrono::Duration::from_std(d)
                .ok()
                .and_then(|d| created_at.checked_add_signed(d)),
        }
    }

    /// Fill the retention fields of a freshly created record.
    pub fn stamp(&self, record: &mut BackupRecord) {
        let rule = self.rule(record.backup_type);
        record.retention_policy = self.describe(record.backup_type);
        record.expires_at = self.expires_at(record.backup_type, record.created_at);
        record.s3_upload_status = rule.remote_enabled.then_some(UploadStatus::Pending);
    }
}

/// Outcome of one enforcement pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EnforcementReport {
    pub expired: u64,
    pub purged: u64,
    pub failures: Vec<String>,
}

/// Applies expiry to a store.
pub struct RetentionService;

impl RetentionService {
    /// Mark every completed record whose expiry has passed as deleted, then
    /// purge deleted records older than `grace`.
    pub async fn enforce(
        store: &dyn MetadataStore,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<EnforcementReport> {
        let mut report = EnforcementReport::default();
        let active = store
            .list(&RecordFilter {
                active_only: true,
                ..Default::default()
            })
            .await?;

        for record in active {
            let expired = record.expires_at.is_some_and(|at| at <= now);
            if !expired || record.status == BackupStatus::Pending {
                continue;
            }
            match store.mark_deleted(&record.id).await {
                Ok(true) => {
                    tracing::info!(id = %record.id, "Backup expired, marked deleted");
                    report.expired += 1;
                }
                Ok(false) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "Failed to expire backup");
                    report.failures.push(format!("{}: {}", record.id, e));
                }
            }
        }

        report.purged = store.purge_deleted(grace).await?;
        tracing::info!(
            expired = report.expired,
            purged = report.purged,
            failures = report.failures.len(),
            "Retention enforcement finished"
        );
        Ok(report)
    }
}
