//! Migration service - moves records from the JSON file store into the
//! relational store.
//!
//! The move is one-way and all-or-nothing: every missing record is inserted
//! in one transaction, so a failure leaves the relational store untouched and
//! a second run has nothing left to do.

use serde::Serialize;
use tracing::{info, instrument};

use crate::error::Result;
use crate::models::query::RecordFilter;
use crate::services::file_store::FileStore;
use crate::services::metadata_store::MetadataStore;
use crate::services::sql_store::SqlStore;

/// Outcome of one migration run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Records found in the file store.
    pub total: u64,
    /// Records inserted into the relational store.
    pub migrated: u64,
    /// Records whose id already existed in the relational store.
    pub skipped: u64,
}

/// Copy every file-store record that the relational store does not have yet.
#[instrument(skip_all, fields(source = %file.path().display()))]
pub async fn migrate_file_to_sql(file: &FileStore, sql: &SqlStore) -> Result<MigrationReport> {
    let records = file.list(&RecordFilter::default()).await?;
    let total = records.len() as u64;
    if records.is_empty() {
        info!("No legacy backup records to migrate");
        return Ok(MigrationReport::default());
    }

    let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
    let existing = sql.existing_ids(&ids).await?;
    let missing: Vec<_> = records
        .into_iter()
        .filter(|r| !existing.contains(&r.id))
        .collect();

    let migrated = if missing.is_empty() {
        0
    } else {
        sql.import_records(&missing).await?
    };
    let report = MigrationReport {
        total,
        migrated,
        skipped: total - migrated,
    };
    info!(
        total = report.total,
        migrated = report.migrated,
        skipped = report.skipped,
        "Legacy metadata migration finished"
    );
    Ok(report)
}
