//! Backup record model.
//!
//! One record tracks one dump artifact (server/database/type/timestamp)
//! through its local lifecycle and, independently, through its remote
//! upload lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppError, Result};

/// Timestamp layout used in record ids and artifact file names.
pub const ID_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Organization tag used when a path has no more specific naming convention.
pub const DEFAULT_ORGANIZATION: &str = "default";

/// Organization tag -> storage path (or object key).
pub type PathMap = BTreeMap<String, String>;

/// Backup type enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Manual,
}

impl BackupType {
    pub const ALL: [BackupType; 6] = [
        BackupType::Hourly,
        BackupType::Daily,
        BackupType::Weekly,
        BackupType::Monthly,
        BackupType::Yearly,
        BackupType::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Hourly => "hourly",
            BackupType::Daily => "daily",
            BackupType::Weekly => "weekly",
            BackupType::Monthly => "monthly",
            BackupType::Yearly => "yearly",
            BackupType::Manual => "manual",
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(BackupType::Hourly),
            "daily" => Ok(BackupType::Daily),
            "weekly" => Ok(BackupType::Weekly),
            "monthly" => Ok(BackupType::Monthly),
            "yearly" => Ok(BackupType::Yearly),
            "manual" => Ok(BackupType::Manual),
            _ => Err(format!("Unknown backup type: {}", s)),
        }
    }
}

/// Local lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Success,
    Error,
    Deleted,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Success => "success",
            BackupStatus::Error => "error",
            BackupStatus::Deleted => "deleted",
        }
    }

    /// Whether the local lifecycle may move from `self` to `next`.
    ///
    /// Re-reporting success or error is allowed (last write wins on size and
    /// paths); nothing ever returns to pending and deleted is terminal.
    pub fn can_transition_to(self, next: BackupStatus) -> bool {
        use BackupStatus::*;
        matches!(
            (self, next),
            (Pending, Success)
                | (Pending, Error)
                | (Success, Success)
                | (Error, Error)
                | (Success, Deleted)
                | (Error, Deleted)
        )
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "success" => Ok(BackupStatus::Success),
            "error" => Ok(BackupStatus::Error),
            "deleted" => Ok(BackupStatus::Deleted),
            _ => Err(format!("Unknown backup status: {}", s)),
        }
    }
}

/// Remote (object storage) upload status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Success,
    Error,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Success => "success",
            UploadStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "success" => Ok(UploadStatus::Success),
            "error" => Ok(UploadStatus::Error),
            _ => Err(format!("Unknown upload status: {}", s)),
        }
    }
}

/// Backup record tracking one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub server_name: String,
    pub server_type: String,
    pub database: String,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: u64,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub local_paths: PathMap,
    #[serde(default)]
    pub s3_keys: PathMap,
    #[serde(default)]
    pub s3_upload_status: Option<UploadStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_upload_error: Option<String>,
    #[serde(default)]
    pub s3_upload_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retention_policy: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<String>,
}

impl BackupRecord {
    /// Build the deterministic record id `server-database-type-YYYYMMDD-HHMMSS`.
    pub fn make_id(
        server_name: &str,
        database: &str,
        backup_type: BackupType,
        created_at: DateTime<Utc>,
    ) -> String {
        format!(
            "{}-{}-{}-{}",
            server_name,
            database,
            backup_type,
            created_at.format(ID_TIMESTAMP_FORMAT)
        )
    }

    /// Fresh pending record. Retention fields are filled in by the store.
    pub fn pending(req: &NewRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Self::make_id(&req.server_name, &req.database, req.backup_type, created_at),
            server_name: req.server_name.clone(),
            server_type: req.server_type.clone(),
            database: req.database.clone(),
            backup_type: req.backup_type,
            created_at,
            completed_at: None,
            size: 0,
            status: BackupStatus::Pending,
            error_message: None,
            local_paths: PathMap::new(),
            s3_keys: PathMap::new(),
            s3_upload_status: None,
            s3_upload_error: None,
            s3_upload_completed_at: None,
            retention_policy: String::new(),
            expires_at: None,
            log_file_path: None,
        }
    }

    /// First local path, for callers that only understand a single location.
    pub fn primary_local_path(&self) -> Option<&str> {
        self.local_paths.values().next().map(String::as_str)
    }

    /// First object key, for callers that only understand a single location.
    pub fn primary_s3_key(&self) -> Option<&str> {
        self.s3_keys.values().next().map(String::as_str)
    }

    pub fn is_active(&self) -> bool {
        self.status != BackupStatus::Deleted
    }

    /// Completion time used by purging; records that never completed fall back
    /// to their creation time.
    pub fn completion_time(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }

    /// Apply a local completion update in place.
    pub fn apply_local(&mut self, update: &LocalUpdate, now: DateTime<Utc>) -> Result<()> {
        check_local_transition(&self.id, self.status, update.status)?;
        check_size(update.size)?;
        self.status = update.status;
        self.local_paths = update.local_paths.clone();
        self.size = update.size;
        self.completed_at = Some(update.completed_at.unwrap_or(now));
        self.error_message = match update.status {
            BackupStatus::Error => update.error_message.clone(),
            _ => None,
        };
        Ok(())
    }

    /// Apply a remote upload update in place.
    pub fn apply_remote(&mut self, update: &RemoteUpdate, now: DateTime<Utc>) -> Result<()> {
        check_remote_allowed(&self.id, self.status)?;
        self.s3_upload_status = Some(update.status);
        self.s3_keys = update.s3_keys.clone();
        self.s3_upload_error = match update.status {
            UploadStatus::Error => update.error_message.clone(),
            _ => None,
        };
        self.s3_upload_completed_at = match update.status {
            UploadStatus::Pending => None,
            _ => Some(update.completed_at.unwrap_or(now)),
        };
        Ok(())
    }
}

/// Reject local updates that would break the monotonic lifecycle.
///
/// `update_local_status` may only report success or error; deletion goes
/// through `mark_deleted`.
pub fn check_local_transition(id: &str, from: BackupStatus, to: BackupStatus) -> Result<()> {
    if !matches!(to, BackupStatus::Success | BackupStatus::Error) {
        return Err(AppError::Validation(format!(
            "local status update must be success or error, got {}",
            to
        )));
    }
    if !from.can_transition_to(to) {
        return Err(AppError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        });
    }
    Ok(())
}

/// Largest artifact size any store accepts; the relational schema stores
/// sizes as signed 64-bit integers.
pub const MAX_ARTIFACT_SIZE: u64 = i64::MAX as u64;

/// Reject sizes that not every backend can represent.
pub fn check_size(size: u64) -> Result<()> {
    if size > MAX_ARTIFACT_SIZE {
        return Err(AppError::Validation(format!(
            "size {} exceeds the maximum of {} bytes",
            size, MAX_ARTIFACT_SIZE
        )));
    }
    Ok(())
}

/// Remote status may change freely, except once the record is deleted.
pub fn check_remote_allowed(id: &str, current: BackupStatus) -> Result<()> {
    if current == BackupStatus::Deleted {
        return Err(AppError::InvalidTransition {
            id: id.to_string(),
            from: current,
            to: current,
        });
    }
    Ok(())
}

/// Request to create a pending record.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub server_name: String,
    pub server_type: String,
    pub database: String,
    pub backup_type: BackupType,
    /// Creation time; `None` means now.
    pub created_at: Option<DateTime<Utc>>,
}

impl NewRecord {
    pub fn new(
        server_name: impl Into<String>,
        server_type: impl Into<String>,
        database: impl Into<String>,
        backup_type: BackupType,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            server_type: server_type.into(),
            database: database.into(),
            backup_type,
            created_at: None,
        }
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }
}

/// Local completion update.
#[derive(Debug, Clone)]
pub struct LocalUpdate {
    pub status: BackupStatus,
    /// Replaces the record's whole path map.
    pub local_paths: PathMap,
    pub size: u64,
    pub error_message: Option<String>,
    /// Completion time; `None` means now.
    pub completed_at: Option<DateTime<Utc>>,
}

impl LocalUpdate {
    pub fn success(local_paths: PathMap, size: u64) -> Self {
        Self {
            status: BackupStatus::Success,
            local_paths,
            size,
            error_message: None,
            completed_at: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: BackupStatus::Error,
            local_paths: PathMap::new(),
            size: 0,
            error_message: Some(message.into()),
            completed_at: None,
        }
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

/// Remote upload update.
#[derive(Debug, Clone)]
pub struct RemoteUpdate {
    pub status: UploadStatus,
    /// Replaces the record's whole key map.
    pub s3_keys: PathMap,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RemoteUpdate {
    pub fn success(s3_keys: PathMap) -> Self {
        Self {
            status: UploadStatus::Success,
            s3_keys,
            error_message: None,
            completed_at: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::Error,
            s3_keys: PathMap::new(),
            error_message: Some(message.into()),
            completed_at: None,
        }
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

/// Build a single-entry path map.
pub fn path_map(organization: &str, path: impl Into<String>) -> PathMap {
    let mut map = PathMap::new();
    map.insert(organization.to_string(), path.into());
    map
}
