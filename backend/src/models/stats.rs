//! Aggregate statistics derived from the record set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::backup::{BackupRecord, BackupStatus, UploadStatus};

/// Totals and group counts over all records.
///
/// Never authored directly: every store recomputes these from its records
/// after each mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_records: u64,
    /// Sum of `size` over records with status = success.
    pub total_local_size: u64,
    /// Sum of `size` over records whose upload status = success.
    pub total_s3_size: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub by_server: BTreeMap<String, u64>,
    pub by_database: BTreeMap<String, u64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl AggregateStats {
    /// Full scan over `records`.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a BackupRecord>,
    {
        let mut stats = AggregateStats::default();
        for record in records {
            stats.total_records += 1;
            if record.status == BackupStatus::Success {
                stats.total_local_size = stats.total_local_size.saturating_add(record.size);
            }
            if record.s3_upload_status == Some(UploadStatus::Success) {
                stats.total_s3_size = stats.total_s3_size.saturating_add(record.size);
            }
            *stats
                .by_status
                .entry(record.status.to_string())
                .or_default() += 1;
            *stats
                .by_type
                .entry(record.backup_type.to_string())
                .or_default() += 1;
            *stats
                .by_server
                .entry(record.server_name.clone())
                .or_default() += 1;
            *stats
                .by_database
                .entry(record.database.clone())
                .or_default() += 1;
        }
        stats
    }

    /// Sizes of the two totals, ignoring timestamps and groupings.
    pub fn totals(&self) -> (u64, u64, u64) {
        (self.total_records, self.total_local_size, self.total_s3_size)
    }

    pub fn count_with_status(&self, status: BackupStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}
