//! File-backed metadata store.
//!
//! The whole record set lives in memory behind one read/write lock and is
//! mirrored to a single JSON document. Every mutation rewrites the document
//! atomically (temp file + rename) before the new state becomes visible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::metadata_store::{new_pending_record, purge_cutoff, MetadataStore};
use super::retention_service::RetentionConfig;
use crate::error::{AppError, Result};
use crate::models::backup::{
    BackupRecord, BackupStatus, LocalUpdate, NewRecord, RemoteUpdate, DEFAULT_ORGANIZATION,
};
use crate::models::query::{sort_records, RecordFilter, SortOrder};
use crate::models::stats::AggregateStats;

/// Version tag written into the document.
pub const METADATA_VERSION: &str = "1.0";

/// The persisted document.
#[derive(Debug, Clone, Serialize)]
struct MetadataDocument {
    version: String,
    last_updated: DateTime<Utc>,
    total_local_size: u64,
    total_s3_size: u64,
    backups: Vec<BackupRecord>,
}

impl MetadataDocument {
    fn empty() -> Self {
        Self {
            version: METADATA_VERSION.to_string(),
            last_updated: Utc::now(),
            total_local_size: 0,
            total_s3_size: 0,
            backups: Vec::new(),
        }
    }

    fn find(&self, id: &str) -> Option<&BackupRecord> {
        self.backups.iter().find(|r| r.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut BackupRecord> {
        self.backups
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| AppError::record_not_found(id))
    }

    /// Full-scan recomputation of the stored totals.
    fn refresh(&mut self, now: DateTime<Utc>) {
        let stats = AggregateStats::from_records(&self.backups);
        self.total_local_size = stats.total_local_size;
        self.total_s3_size = stats.total_s3_size;
        self.last_updated = now;
    }
}

/// On-disk shape accepted when reading. Stored totals are ignored and
/// recomputed; legacy single-location fields are folded into the maps.
#[derive(Debug, Deserialize)]
struct StoredDocument {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    backups: Vec<StoredRecord>,
}

#[derive(Debug, Deserialize)]
struct StoredRecord {
    #[serde(flatten)]
    record: BackupRecord,
    #[serde(default)]
    local_path: Option<String>,
    #[serde(default)]
    s3_key: Option<String>,
}

impl StoredRecord {
    fn into_record(self) -> BackupRecord {
        let mut record = self.record;
        if record.local_paths.is_empty() {
            if let Some(path) = self.local_path.filter(|p| !p.is_empty()) {
                record.local_paths.insert(DEFAULT_ORGANIZATION.to_string(), path);
            }
        }
        if record.s3_keys.is_empty() {
            if let Some(key) = self.s3_key.filter(|k| !k.is_empty()) {
                record.s3_keys.insert(DEFAULT_ORGANIZATION.to_string(), key);
            }
        }
        record
    }
}

impl StoredDocument {
    fn into_document(self, path: &Path) -> MetadataDocument {
        let mut backups: Vec<BackupRecord> = Vec::with_capacity(self.backups.len());
        let mut index: HashMap<String, usize> = HashMap::new();
        for stored in self.backups {
            let record = stored.into_record();
            match index.get(&record.id) {
                Some(&pos) => {
                    tracing::warn!(
                        path = %path.display(),
                        id = %record.id,
                        "Duplicate backup id in metadata file; keeping the later entry"
                    );
                    backups[pos] = record;
                }
                None => {
                    index.insert(record.id.clone(), backups.len());
                    backups.push(record);
                }
            }
        }

        let mut document = MetadataDocument {
            version: self.version.unwrap_or_else(|| METADATA_VERSION.to_string()),
            last_updated: self.last_updated.unwrap_or_else(Utc::now),
            total_local_size: 0,
            total_s3_size: 0,
            backups,
        };
        let last_updated = document.last_updated;
        document.refresh(last_updated);
        document
    }
}

/// JSON-on-disk metadata store
pub struct FileStore {
    path: PathBuf,
    retention: Arc<RetentionConfig>,
    state: RwLock<MetadataDocument>,
}

impl FileStore {
    /// Open the store at `path`, creating an empty document when the file
    /// does not exist. An unparsable file is reported as corruption.
    pub async fn open(path: impl Into<PathBuf>, retention: Arc<RetentionConfig>) -> Result<Self> {
        let path = path.into();
        let document = match read_document(&path).await? {
            Some(document) => {
                tracing::info!(
                    path = %path.display(),
                    records = document.backups.len(),
                    "Loaded backup metadata"
                );
                document
            }
            None => {
                let document = MetadataDocument::empty();
                write_document(&path, &document).await?;
                tracing::info!(path = %path.display(), "Created empty backup metadata file");
                document
            }
        };

        Ok(Self {
            path,
            retention,
            state: RwLock::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the state, persist it, then install it.
    /// On any error the previous state stays in place.
    async fn mutate<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut MetadataDocument) -> Result<T>,
    {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let out = change(&mut next)?;
        next.refresh(Utc::now());
        write_document(&self.path, &next).await?;
        *state = next;
        Ok(out)
    }
}

#[async_trait]
impl MetadataStore for FileStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn create_record(&self, req: NewRecord) -> Result<BackupRecord> {
        let record = new_pending_record(&req, &self.retention)?;

        let mut state = self.state.write().await;
        if let Some(existing) = state.find(&record.id) {
            tracing::warn!(id = %record.id, "Backup record already exists; returning it unchanged");
            return Ok(existing.clone());
        }

        state.backups.push(record.clone());
        state.refresh(Utc::now());
        if let Err(e) = write_document(&self.path, &state).await {
            tracing::error!(
                id = %record.id,
                path = %self.path.display(),
                error = %e,
                "Failed to persist new backup record; kept in memory"
            );
        }

        tracing::debug!(id = %record.id, "Created backup record");
        Ok(record)
    }

    async fn update_local_status(&self, id: &str, update: LocalUpdate) -> Result<BackupRecord> {
        let now = Utc::now();
        let record = self
            .mutate(|doc| {
                let record = doc.find_mut(id)?;
                record.apply_local(&update, now)?;
                Ok(record.clone())
            })
            .await?;
        tracing::debug!(
            id = %id,
            status = %record.status,
            size = record.size,
            "Updated local status"
        );
        Ok(record)
    }

    async fn update_remote_status(
        &self,
        id: &str,
        update: RemoteUpdate,
    ) -> Result<BackupRecord> {
        let now = Utc::now();
        let record = self
            .mutate(|doc| {
                let record = doc.find_mut(id)?;
                record.apply_remote(&update, now)?;
                Ok(record.clone())
            })
            .await?;
        tracing::debug!(id = %id, status = %update.status, "Updated remote upload status");
        Ok(record)
    }

    async fn update_log_path(&self, id: &str, path: &str) -> Result<()> {
        self.mutate(|doc| {
            doc.find_mut(id)?.log_file_path = Some(path.to_string());
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<BackupRecord>> {
        let state = self.state.read().await;
        Ok(state.find(id).cloned())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>> {
        filter.validate()?;
        let mut records: Vec<BackupRecord> = {
            let state = self.state.read().await;
            state
                .backups
                .iter()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect()
        };
        sort_records(&mut records, SortOrder::NewestFirst);
        Ok(records)
    }

    async fn mark_deleted(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let current = state
            .find(id)
            .map(|r| r.status)
            .ok_or_else(|| AppError::record_not_found(id))?;
        if !current.can_transition_to(BackupStatus::Deleted) {
            tracing::debug!(id = %id, status = %current, "mark_deleted ignored");
            return Ok(false);
        }

        let mut next = state.clone();
        next.find_mut(id)?.status = BackupStatus::Deleted;
        next.refresh(Utc::now());
        write_document(&self.path, &next).await?;
        *state = next;
        tracing::info!(id = %id, "Backup record marked deleted");
        Ok(true)
    }

    async fn purge_deleted(&self, older_than: Duration) -> Result<u64> {
        let cutoff = purge_cutoff(older_than)?;
        let mut state = self.state.write().await;
        let is_purgeable = |r: &BackupRecord| {
            r.status == BackupStatus::Deleted && r.completion_time() < cutoff
        };
        let purged = state.backups.iter().filter(|r| is_purgeable(r)).count() as u64;
        if purged == 0 {
            return Ok(0);
        }

        let mut next = state.clone();
        next.backups.retain(|r| !is_purgeable(r));
        next.refresh(Utc::now());
        write_document(&self.path, &next).await?;
        *state = next;
        tracing::info!(purged, "Purged deleted backup records");
        Ok(purged)
    }

    async fn stats(&self) -> Result<AggregateStats> {
        let state = self.state.read().await;
        let mut stats = AggregateStats::from_records(&state.backups);
        stats.last_updated = Some(state.last_updated);
        Ok(stats)
    }

    async fn load(&self) -> Result<()> {
        let mut state = self.state.write().await;
        *state = match read_document(&self.path).await? {
            Some(document) => document,
            None => {
                let document = MetadataDocument::empty();
                write_document(&self.path, &document).await?;
                document
            }
        };
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.refresh(Utc::now());
        write_document(&self.path, &next).await?;
        *state = next;
        Ok(())
    }
}

/// Read and parse the document; `None` when the file does not exist.
async fn read_document(path: &Path) -> Result<Option<MetadataDocument>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AppError::Io(e)),
    };
    let stored: StoredDocument = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::Corruption(format!("{}: {}", path.display(), e)))?;
    Ok(Some(stored.into_document(path)))
}

/// Write atomically via temp file in the same directory.
async fn write_document(path: &Path, document: &MetadataDocument) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_vec_pretty(document)?;

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(&content).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(AppError::Io(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup::{path_map, BackupType, UploadStatus};
    use tempfile::TempDir;

    async fn create_test_store() -> (FileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("meta").join("backup-metadata.json");
        let store = FileStore::open(path, Arc::new(RetentionConfig::default()))
            .await
            .unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_open_creates_empty_file() {
        let (store, _temp) = create_test_store().await;
        assert!(store.path().exists());
        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], "1.0");
        assert_eq!(value["backups"].as_array().unwrap().len(), 0);
        assert!(value["last_updated"].is_string());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup-metadata.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = FileStore::open(&path, Arc::new(RetentionConfig::default()))
            .await
            .err()
            .expect("corrupt file must not open");
        assert!(matches!(err, AppError::Corruption(_)));
        // The file is left alone for an operator to inspect.
        assert_eq!(std::fs::read(&path).unwrap(), b"{ not json");
    }

    #[tokio::test]
    async fn test_create_and_update() {
        let (store, _temp) = create_test_store().await;
        let record = store
            .create_record(NewRecord::new("s1", "mysql", "db1", BackupType::Daily))
            .await
            .unwrap();
        assert_eq!(record.status, BackupStatus::Pending);

        store
            .update_local_status(
                &record.id,
                LocalUpdate::success(path_map("default", "/b/x.sql.gz"), 1_048_576),
            )
            .await
            .unwrap();

        let fetched = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, BackupStatus::Success);
        assert_eq!(fetched.size, 1_048_576);
        assert_eq!(fetched.local_paths["default"], "/b/x.sql.gz");
        assert_eq!(store.stats().await.unwrap().total_local_size, 1_048_576);
    }

    #[tokio::test]
    async fn test_update_missing_record_is_not_found() {
        let (store, _temp) = create_test_store().await;
        let err = store
            .update_local_status("nope", LocalUpdate::success(Default::default(), 1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let err = store.mark_deleted("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let (store, _temp) = create_test_store().await;
        let record = store
            .create_record(NewRecord::new("s1", "postgresql", "app", BackupType::Weekly))
            .await
            .unwrap();
        store
            .update_local_status(&record.id, LocalUpdate::success(path_map("by-server", "/a"), 42))
            .await
            .unwrap();
        store
            .update_remote_status(&record.id, RemoteUpdate::success(path_map("by-server", "k/a")))
            .await
            .unwrap();
        store.update_log_path(&record.id, "/var/log/dump.log").await.unwrap();
        store.save().await.unwrap();

        let before = store.list(&RecordFilter::default()).await.unwrap();
        let reopened = FileStore::open(store.path(), Arc::new(RetentionConfig::default()))
            .await
            .unwrap();
        let after = reopened.list(&RecordFilter::default()).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after[0].s3_upload_status, Some(UploadStatus::Success));
        assert_eq!(reopened.stats().await.unwrap().total_s3_size, 42);
    }

    #[tokio::test]
    async fn test_legacy_single_path_fields_are_folded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup-metadata.json");
        let legacy = serde_json::json!({
            "version": "0.9",
            "backups": [{
                "id": "s1-db1-daily-20250101-020000",
                "server_name": "s1",
                "server_type": "mysql",
                "database": "db1",
                "backup_type": "daily",
                "created_at": "2025-01-01T02:00:00Z",
                "size": 10,
                "status": "success",
                "local_path": "/b/s1-db1-daily-20250101-020000.sql.gz",
                "s3_key": "backups/s1-db1-daily-20250101-020000.sql.gz"
            }]
        });
        std::fs::write(&path, serde_json::to_vec(&legacy).unwrap()).unwrap();

        let store = FileStore::open(&path, Arc::new(RetentionConfig::default()))
            .await
            .unwrap();
        let record = store
            .get("s1-db1-daily-20250101-020000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            record.primary_local_path(),
            Some("/b/s1-db1-daily-20250101-020000.sql.gz")
        );
        assert!(record.s3_keys.contains_key(DEFAULT_ORGANIZATION));
        assert_eq!(store.stats().await.unwrap().total_local_size, 10);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_state() {
        let (store, _temp) = create_test_store().await;
        let record = store
            .create_record(NewRecord::new("s1", "mysql", "db1", BackupType::Daily))
            .await
            .unwrap();

        // A directory where the document should be makes the rename fail.
        std::fs::remove_file(store.path()).unwrap();
        std::fs::create_dir(store.path()).unwrap();

        let err = store
            .update_local_status(&record.id, LocalUpdate::success(Default::default(), 99))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        let current = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(current.status, BackupStatus::Pending);
        assert_eq!(store.stats().await.unwrap().total_local_size, 0);

        // Creation is never blocked by the backend.
        let other = store
            .create_record(NewRecord::new("s2", "mysql", "db1", BackupType::Daily))
            .await
            .unwrap();
        assert!(store.get(&other.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_respects_age() {
        let (store, _temp) = create_test_store().await;
        let old = store
            .create_record(NewRecord::new("s1", "mysql", "db1", BackupType::Daily))
            .await
            .unwrap();
        let recent = store
            .create_record(NewRecord::new("s2", "mysql", "db1", BackupType::Daily))
            .await
            .unwrap();
        for (id, age) in [(&old.id, 120), (&recent.id, 10)] {
            store
                .update_local_status(
                    id,
                    LocalUpdate::success(Default::default(), 5)
                        .completed_at(Utc::now() - chrono::Duration::minutes(age)),
                )
                .await
                .unwrap();
            assert!(store.mark_deleted(id).await.unwrap());
        }

        assert_eq!(store.purge_deleted(Duration::from_secs(3600)).await.unwrap(), 1);
        assert!(store.get(&old.id).await.unwrap().is_none());
        assert!(store.get(&recent.id).await.unwrap().is_some());
        assert_eq!(store.stats().await.unwrap().total_records, 1);
    }
}
