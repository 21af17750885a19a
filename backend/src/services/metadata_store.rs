//! Metadata store interface shared by every persistence backend.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::backup::{BackupRecord, LocalUpdate, NewRecord, RemoteUpdate};
use crate::models::query::{ListQuery, Page, RecordFilter};
use crate::models::stats::AggregateStats;
use crate::services::retention_service::RetentionConfig;

/// Capability set every metadata backend provides.
///
/// Implementations serialize conflicting access themselves; callers share
/// one instance behind an `Arc` and never touch persisted state directly.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Short backend name for logs ("file", "sqlite").
    fn backend_name(&self) -> &'static str;

    /// Persist a new pending record and return it.
    ///
    /// Only invalid arguments are reported as errors. A failed write is
    /// logged and the record is still returned, so a running backup is never
    /// blocked by the metadata backend. If the id already exists the stored
    /// record is returned unchanged.
    async fn create_record(&self, req: NewRecord) -> Result<BackupRecord>;

    /// Record the local outcome. Replaces the whole local path map.
    async fn update_local_status(&self, id: &str, update: LocalUpdate) -> Result<BackupRecord>;

    /// Record the remote upload outcome. Replaces the whole key map.
    async fn update_remote_status(&self, id: &str, update: RemoteUpdate) -> Result<BackupRecord>;

    async fn update_log_path(&self, id: &str, path: &str) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<BackupRecord>>;

    /// All matching records, newest first.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>>;

    /// Soft-delete a completed record. Returns `false` when the record is
    /// pending or already deleted.
    async fn mark_deleted(&self, id: &str) -> Result<bool>;

    /// Remove deleted records completed more than `older_than` ago.
    async fn purge_deleted(&self, older_than: Duration) -> Result<u64>;

    async fn stats(&self) -> Result<AggregateStats>;

    /// Reload persisted state. No-op for backends that never cache.
    async fn load(&self) -> Result<()>;

    /// Flush state to persistent storage. No-op for backends that persist on
    /// every write.
    async fn save(&self) -> Result<()>;

    /// Pushed-down paginated queries, when the backend supports them.
    fn paginated(&self) -> Option<&dyn PaginatedQuery> {
        None
    }
}

/// Optional capability: filtering, sorting and paging done by the backend.
#[async_trait]
pub trait PaginatedQuery: Send + Sync {
    async fn query_page(&self, query: &ListQuery) -> Result<Page<BackupRecord>>;
}

/// Page through any store, using the backend's query when it has one.
pub async fn list_page(store: &dyn MetadataStore, query: &ListQuery) -> Result<Page<BackupRecord>> {
    query.validate()?;
    if let Some(paged) = store.paginated() {
        return paged.query_page(query).await;
    }
    let records = store.list(&query.filter).await?;
    Ok(query.apply(records))
}

/// Validate a create request and build the pending record it describes.
pub(crate) fn new_pending_record(
    req: &NewRecord,
    retention: &RetentionConfig,
) -> Result<BackupRecord> {
    for (field, value) in [
        ("server_name", &req.server_name),
        ("server_type", &req.server_type),
        ("database", &req.database),
    ] {
        if value.trim().is_empty() {
            return Err(AppError::Validation(format!("{} must not be empty", field)));
        }
        if value.contains('/') || value.contains('\\') {
            return Err(AppError::Validation(format!(
                "{} must not contain path separators",
                field
            )));
        }
    }

    let created_at = req.created_at.unwrap_or_else(Utc::now);
    let mut record = BackupRecord::pending(req, created_at);
    retention.stamp(&mut record);
    Ok(record)
}

/// `now - older_than` as a timestamp.
pub(crate) fn purge_cutoff(older_than: Duration) -> Result<chrono::DateTime<Utc>> {
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .ok_or_else(|| AppError::Validation(format!("purge age {:?} is out of range", older_than)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup::BackupType;

    #[test]
    fn test_new_pending_record_validates() {
        let retention = RetentionConfig::default();
        let ok = new_pending_record(
            &NewRecord::new("s1", "mysql", "db1", BackupType::Daily),
            &retention,
        )
        .unwrap();
        assert!(ok.id.starts_with("s1-db1-daily-"));
        assert_eq!(ok.retention_policy, "keep 7days");
        assert!(ok.expires_at.is_some());

        let empty = new_pending_record(
            &NewRecord::new("", "mysql", "db1", BackupType::Daily),
            &retention,
        );
        assert!(matches!(empty, Err(AppError::Validation(_))));

        let slash = new_pending_record(
            &NewRecord::new("s1", "mysql", "../db1", BackupType::Daily),
            &retention,
        );
        assert!(matches!(slash, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_purge_cutoff() {
        let cutoff = purge_cutoff(Duration::from_secs(3600)).unwrap();
        let expected = Utc::now() - chrono::Duration::hours(1);
        assert!((cutoff - expected).num_seconds().abs() <= 1);
        assert!(purge_cutoff(Duration::from_secs(u64::MAX)).is_err());
    }
}
