//! Recovery scanner.
//!
//! Rebuilds metadata from the artifacts themselves: every dump file found
//! locally or in the bucket whose name follows
//! `{server}-{database}-{type}-{YYYYMMDD-HHMMSS}.sql.gz` becomes a completed
//! record. Sightings of the same artifact in several places are merged into
//! one record carrying every path and key.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::backup::{
    BackupRecord, BackupType, LocalUpdate, NewRecord, PathMap, RemoteUpdate, ID_TIMESTAMP_FORMAT,
};
use crate::services::metadata_store::MetadataStore;
use crate::storage::{ArtifactSource, DiscoveredObject, ObjectLocation};

/// Server type stored on recovered records; the file name does not carry it.
pub const RECOVERED_SERVER_TYPE: &str = "unknown";

/// Default gap between a recovered artifact's creation and completion.
pub const DEFAULT_COMPLETION_ESTIMATE: Duration = Duration::from_secs(5 * 60);

fn artifact_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([^-]+)-(.+)-(hourly|daily|weekly|monthly|yearly|manual)-(\d{8}-\d{6})\.sql\.gz$",
        )
        .unwrap()
    })
}

/// Fields encoded in an artifact file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub server: String,
    pub database: String,
    pub backup_type: BackupType,
    /// Raw `YYYYMMDD-HHMMSS` segment.
    pub timestamp: String,
    /// `None` when the segment is not a real calendar time.
    pub created_at: Option<DateTime<Utc>>,
}

impl ParsedName {
    /// Grouping key; equal to the record id when the timestamp parses.
    pub fn key(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.server, self.database, self.backup_type, self.timestamp
        )
    }
}

/// Parse a dump file name. Server names cannot contain `-`; everything
/// between the server and the type belongs to the database name.
pub fn parse_artifact_name(file_name: &str) -> Option<ParsedName> {
    let caps = artifact_name_regex().captures(file_name)?;
    let backup_type = caps[3].parse().ok()?;
    let timestamp = caps[4].to_string();
    let created_at = NaiveDateTime::parse_from_str(&timestamp, ID_TIMESTAMP_FORMAT)
        .ok()
        .map(|t| t.and_utc());
    Some(ParsedName {
        server: caps[1].to_string(),
        database: caps[2].to_string(),
        backup_type,
        timestamp,
        created_at,
    })
}

/// One artifact after merging all of its sightings.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: ParsedName,
    pub local_paths: PathMap,
    pub s3_keys: PathMap,
    pub local_size: Option<u64>,
    pub remote_size: Option<u64>,
    /// Earliest modification time across sightings.
    pub modified: Option<DateTime<Utc>>,
    pub sightings: u64,
}

impl Candidate {
    fn new(name: ParsedName) -> Self {
        Self {
            name,
            local_paths: PathMap::new(),
            s3_keys: PathMap::new(),
            local_size: None,
            remote_size: None,
            modified: None,
            sightings: 0,
        }
    }

    fn absorb(&mut self, object: DiscoveredObject) {
        self.sightings += 1;
        self.modified = match (self.modified, object.modified) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match object.location {
            ObjectLocation::Local(path) => {
                self.local_size.get_or_insert(object.size);
                self.local_paths
                    .insert(object.organization, path.to_string_lossy().into_owned());
            }
            ObjectLocation::Remote(key) => {
                self.remote_size.get_or_insert(object.size);
                self.s3_keys.insert(object.organization, key);
            }
        }
    }

    /// Size from a local sighting, else from the bucket.
    pub fn size(&self) -> u64 {
        self.local_size.or(self.remote_size).unwrap_or(0)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.name.created_at.or(self.modified)
    }

    pub fn record_id(&self) -> Option<String> {
        self.created_at().map(|at| {
            BackupRecord::make_id(&self.name.server, &self.name.database, self.name.backup_type, at)
        })
    }
}

/// Result of grouping discovered objects.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub candidates: Vec<Candidate>,
    pub unmatched: u64,
    pub duplicates_merged: u64,
}

/// Group objects by artifact. Names that do not parse are counted and
/// skipped.
pub fn reconcile(objects: Vec<DiscoveredObject>, verbose: bool) -> Reconciled {
    let mut groups: BTreeMap<String, Candidate> = BTreeMap::new();
    let mut unmatched = 0u64;

    for object in objects {
        let Some(name) = parse_artifact_name(&object.file_name) else {
            unmatched += 1;
            if verbose {
                tracing::info!(location = %object.location, "Skipping file with unrecognised name");
            } else {
                tracing::debug!(
                    location = %object.location,
                    "Skipping file with unrecognised name"
                );
            }
            continue;
        };
        groups
            .entry(name.key())
            .or_insert_with(|| Candidate::new(name))
            .absorb(object);
    }

    let duplicates_merged = groups.values().map(|c| c.sightings.saturating_sub(1)).sum();
    Reconciled {
        candidates: groups.into_values().collect(),
        unmatched,
        duplicates_merged,
    }
}

/// Flags for one recovery run
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Compute the report without writing.
    pub dry_run: bool,
    /// Log every skipped file at info level.
    pub verbose: bool,
    pub scan_local: bool,
    pub scan_remote: bool,
    /// Proceed even when the store already has records.
    pub force: bool,
    /// Skip artifacts whose id is already stored.
    pub merge: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            verbose: false,
            scan_local: true,
            scan_remote: true,
            force: false,
            merge: false,
        }
    }
}

/// Outcome of one recovery run
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryReport {
    /// Files listed by all sources.
    pub discovered: u64,
    /// Files whose name is not an artifact name.
    pub unmatched: u64,
    /// Extra sightings folded into an existing candidate.
    pub duplicates_merged: u64,
    /// Records written (or that would be written, in a dry run).
    pub recovered: u64,
    pub skipped_existing: u64,
    pub failed: u64,
    pub failures: Vec<String>,
    pub cancelled: bool,
    pub dry_run: bool,
}

impl RecoveryReport {
    fn fail(&mut self, what: impl std::fmt::Display, error: impl std::fmt::Display) {
        tracing::warn!(item = %what, error = %error, "Recovery failure");
        self.failed += 1;
        self.failures.push(format!("{}: {}", what, error));
    }
}

/// Rebuilds store contents from discovered artifacts
pub struct RecoveryService {
    store: Arc<dyn MetadataStore>,
    local: Option<Box<dyn ArtifactSource>>,
    remote: Option<Box<dyn ArtifactSource>>,
    completion_estimate: Duration,
    cancel_token: CancellationToken,
}

impl RecoveryService {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            local: None,
            remote: None,
            completion_estimate: DEFAULT_COMPLETION_ESTIMATE,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_local_source(mut self, source: Box<dyn ArtifactSource>) -> Self {
        self.local = Some(source);
        self
    }

    pub fn with_remote_source(mut self, source: Box<dyn ArtifactSource>) -> Self {
        self.remote = Some(source);
        self
    }

    pub fn with_completion_estimate(mut self, estimate: Duration) -> Self {
        self.completion_estimate = estimate;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Run discovery, reconciliation and materialization.
    ///
    /// Refuses with `Conflict` when the store already holds records and
    /// neither `force` nor `merge` is set. Per-artifact problems end up in
    /// the report and never abort the run.
    pub async fn run(&self, options: &RecoveryOptions) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            dry_run: options.dry_run,
            ..Default::default()
        };

        if !options.force && !options.merge {
            let existing = self.store.stats().await?.total_records;
            if existing > 0 {
                return Err(AppError::Conflict(format!(
                    "store already holds {} records; use merge or force",
                    existing
                )));
            }
        }

        let mut objects = Vec::new();
        let sources = [
            (options.scan_local, self.local.as_deref()),
            (options.scan_remote, self.remote.as_deref()),
        ];
        for source in sources.into_iter().filter_map(|(on, s)| s.filter(|_| on)) {
            match source.discover().await {
                Ok(discovery) => {
                    for error in discovery.errors {
                        report.fail(source.name(), error);
                    }
                    objects.extend(discovery.objects);
                }
                Err(e) => report.fail(source.name(), e),
            }
        }
        report.discovered = objects.len() as u64;

        let reconciled = reconcile(objects, options.verbose);
        report.unmatched = reconciled.unmatched;
        report.duplicates_merged = reconciled.duplicates_merged;

        for candidate in reconciled.candidates {
            if self.cancel_token.is_cancelled() {
                tracing::info!("Recovery cancelled");
                report.cancelled = true;
                break;
            }
            let key = candidate.name.key();
            let Some(id) = candidate.record_id() else {
                report.fail(key, "no usable timestamp in name or modification time");
                continue;
            };

            if options.merge && !options.force {
                match self.store.get(&id).await {
                    Ok(Some(_)) => {
                        if options.verbose {
                            tracing::info!(id = %id, "Record exists, skipping");
                        }
                        report.skipped_existing += 1;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        report.fail(&id, e);
                        continue;
                    }
                }
            }

            if options.dry_run {
                tracing::debug!(id = %id, "Would recover record");
                report.recovered += 1;
                continue;
            }

            match self.materialize(&candidate).await {
                Ok(record) => {
                    tracing::debug!(id = %record.id, "Recovered record");
                    report.recovered += 1;
                }
                Err(e) => report.fail(&id, e),
            }
        }

        if !options.dry_run {
            if let Err(e) = self.store.save().await {
                tracing::error!(error = %e, "Failed to save recovered metadata");
                report.fail("save", e);
            }
        }

        tracing::info!(
            discovered = report.discovered,
            recovered = report.recovered,
            skipped = report.skipped_existing,
            unmatched = report.unmatched,
            failed = report.failed,
            dry_run = report.dry_run,
            cancelled = report.cancelled,
            "Recovery finished"
        );
        Ok(report)
    }

    async fn materialize(&self, candidate: &Candidate) -> Result<BackupRecord> {
        let created_at = candidate
            .created_at()
            .ok_or_else(|| AppError::Validation("artifact has no creation time".into()))?;
        let completed_at = chrono::Duration::from_std(self.completion_estimate)
            .ok()
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(created_at);

        let record = self
            .store
            .create_record(
                NewRecord::new(
                    &candidate.name.server,
                    RECOVERED_SERVER_TYPE,
                    &candidate.name.database,
                    candidate.name.backup_type,
                )
                .created_at(created_at),
            )
            .await?;

        let mut record = self
            .store
            .update_local_status(
                &record.id,
                LocalUpdate::success(candidate.local_paths.clone(), candidate.size())
                    .completed_at(completed_at),
            )
            .await?;

        if !candidate.s3_keys.is_empty() {
            record = self
                .store
                .update_remote_status(
                    &record.id,
                    RemoteUpdate::success(candidate.s3_keys.clone()).completed_at(completed_at),
                )
                .await?;
        }
        Ok(record)
    }
}
