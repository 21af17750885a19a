//! Relational metadata store backed by SQLite.
//!
//! Records live in `backup_records`; organization-scoped paths and object
//! keys live in two child tables. Every mutation runs in a single
//! transaction that starts with its write and ends by recomputing the
//! singleton `backup_stats` row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::metadata_store::{new_pending_record, purge_cutoff, MetadataStore, PaginatedQuery};
use super::retention_service::RetentionConfig;
use crate::db;
use crate::error::{AppError, Result};
use crate::models::backup::{
    check_remote_allowed, check_size, BackupRecord, BackupStatus, BackupType, LocalUpdate,
    NewRecord, PathMap, RemoteUpdate, UploadStatus,
};
use crate::models::query::{ListQuery, Page, RecordFilter, SortOrder};
use crate::models::stats::AggregateStats;

/// Ids per `IN (...)` clause when loading child rows.
const ID_CHUNK: usize = 500;

const RECORD_COLUMNS: &str = "id, server_name, server_type, database_name, backup_type, \
     created_at, completed_at, size, status, error_message, s3_upload_status, \
     s3_upload_error, s3_upload_completed_at, retention_policy, expires_at, log_file_path";

/// Row shape of `backup_records`.
#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: String,
    server_name: String,
    server_type: String,
    database_name: String,
    backup_type: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    size: i64,
    status: String,
    error_message: Option<String>,
    s3_upload_status: Option<String>,
    s3_upload_error: Option<String>,
    s3_upload_completed_at: Option<DateTime<Utc>>,
    retention_policy: String,
    expires_at: Option<DateTime<Utc>>,
    log_file_path: Option<String>,
}

impl RecordRow {
    fn into_record(self, local_paths: PathMap, s3_keys: PathMap) -> Result<BackupRecord> {
        let corrupt =
            |what: &str, e: String| AppError::Corruption(format!("{} of {}: {}", what, self.id, e));
        let backup_type = self
            .backup_type
            .parse::<BackupType>()
            .map_err(|e| corrupt("backup_type", e))?;
        let status = self
            .status
            .parse::<BackupStatus>()
            .map_err(|e| corrupt("status", e))?;
        let s3_upload_status = self
            .s3_upload_status
            .as_deref()
            .map(str::parse::<UploadStatus>)
            .transpose()
            .map_err(|e| corrupt("s3_upload_status", e))?;

        Ok(BackupRecord {
            id: self.id,
            server_name: self.server_name,
            server_type: self.server_type,
            database: self.database_name,
            backup_type,
            created_at: self.created_at,
            completed_at: self.completed_at,
            size: self.size.max(0) as u64,
            status,
            error_message: self.error_message,
            local_paths,
            s3_keys,
            s3_upload_status,
            s3_upload_error: self.s3_upload_error,
            s3_upload_completed_at: self.s3_upload_completed_at,
            retention_policy: self.retention_policy,
            expires_at: self.expires_at,
            log_file_path: self.log_file_path,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChildRow {
    backup_id: String,
    organization: String,
    value: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    total_records: i64,
    total_local_size: i64,
    total_s3_size: i64,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct GroupCount {
    name: String,
    total: i64,
}

/// Which child table a path map lives in.
#[derive(Debug, Clone, Copy)]
enum ChildTable {
    LocalPaths,
    S3Keys,
}

impl ChildTable {
    fn table(self) -> &'static str {
        match self {
            ChildTable::LocalPaths => "backup_local_paths",
            ChildTable::S3Keys => "backup_s3_keys",
        }
    }

    fn value_column(self) -> &'static str {
        match self {
            ChildTable::LocalPaths => "path",
            ChildTable::S3Keys => "s3_key",
        }
    }
}

/// SQLite-backed metadata store
pub struct SqlStore {
    pool: SqlitePool,
    retention: Arc<RetentionConfig>,
}

impl SqlStore {
    /// Connect, apply migrations and return the store.
    pub async fn connect(database_url: &str, retention: Arc<RetentionConfig>) -> Result<Self> {
        let pool = db::create_pool(database_url).await?;
        db::run_migrations(&pool).await?;
        tracing::info!("Connected to relational metadata store");
        Ok(Self::from_pool(pool, retention))
    }

    /// Wrap an existing, already migrated pool.
    pub fn from_pool(pool: SqlitePool, retention: Arc<RetentionConfig>) -> Self {
        Self { pool, retention }
    }

    /// Recompute the stats row from the record rows.
    pub async fn recompute_stats(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        recompute_stats(&mut tx, Utc::now()).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Ids already present, out of `ids`.
    pub async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let mut conn = self.pool.acquire().await?;
        let mut found = HashSet::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT id FROM backup_records WHERE id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(id.as_str());
            }
            qb.push(")");
            let rows: Vec<String> = qb.build_query_scalar().fetch_all(&mut *conn).await?;
            found.extend(rows);
        }
        Ok(found)
    }

    /// Insert complete records in one transaction. Ids that already exist
    /// are left untouched. Returns how many records were inserted.
    pub async fn import_records(&self, records: &[BackupRecord]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for record in records {
            if insert_record(&mut tx, record).await? {
                inserted += 1;
            }
        }
        recompute_stats(&mut tx, Utc::now()).await?;
        tx.commit().await?;
        Ok(inserted)
    }
}

#[async_trait]
impl MetadataStore for SqlStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn create_record(&self, req: NewRecord) -> Result<BackupRecord> {
        let record = new_pending_record(&req, &self.retention)?;
        match self.try_create(&record).await {
            Ok(Some(existing)) => {
                tracing::warn!(
                    id = %record.id,
                    "Backup record already exists; returning it unchanged"
                );
                Ok(existing)
            }
            Ok(None) => {
                tracing::debug!(id = %record.id, "Created backup record");
                Ok(record)
            }
            Err(e) => {
                tracing::error!(id = %record.id, error = %e, "Failed to persist new backup record");
                Ok(record)
            }
        }
    }

    async fn update_local_status(&self, id: &str, update: LocalUpdate) -> Result<BackupRecord> {
        if !matches!(update.status, BackupStatus::Success | BackupStatus::Error) {
            return Err(AppError::Validation(format!(
                "local status update must be success or error, got {}",
                update.status
            )));
        }
        check_size(update.size)?;
        let now = Utc::now();
        let error_message = match update.status {
            BackupStatus::Error => update.error_message.clone(),
            _ => None,
        };

        let mut tx = self.pool.begin().await?;
        // Pending may move to either outcome; an outcome may only repeat.
        let changed = sqlx::query(
            r#"
            UPDATE backup_records
            SET status = ?, size = ?, completed_at = ?, error_message = ?
            WHERE id = ? AND status IN ('pending', ?)
            "#,
        )
        .bind(update.status.as_str())
        .bind(size_to_db(update.size)?)
        .bind(update.completed_at.unwrap_or(now))
        .bind(&error_message)
        .bind(id)
        .bind(update.status.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if changed == 0 {
            return Err(match current_status(&mut tx, id).await? {
                None => AppError::record_not_found(id),
                Some(from) => AppError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to: update.status,
                },
            });
        }

        replace_child_map(&mut tx, ChildTable::LocalPaths, id, &update.local_paths).await?;
        recompute_stats(&mut tx, now).await?;
        let record = fetch_record(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::record_not_found(id))?;
        tx.commit().await?;

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
        let upload_error = match update.status {
            UploadStatus::Error => update.error_message.clone(),
            _ => None,
        };
        let completed_at = match update.status {
            UploadStatus::Pending => None,
            _ => Some(update.completed_at.unwrap_or(now)),
        };

        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            r#"
            UPDATE backup_records
            SET s3_upload_status = ?, s3_upload_error = ?, s3_upload_completed_at = ?
            WHERE id = ? AND status != 'deleted'
            "#,
        )
        .bind(update.status.as_str())
        .bind(&upload_error)
        .bind(completed_at)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if changed == 0 {
            let current = current_status(&mut tx, id)
                .await?
                .ok_or_else(|| AppError::record_not_found(id))?;
            check_remote_allowed(id, current)?;
            return Err(AppError::Internal(format!("remote update of {} had no effect", id)));
        }

        replace_child_map(&mut tx, ChildTable::S3Keys, id, &update.s3_keys).await?;
        recompute_stats(&mut tx, now).await?;
        let record = fetch_record(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::record_not_found(id))?;
        tx.commit().await?;

        tracing::debug!(id = %id, status = %update.status, "Updated remote upload status");
        Ok(record)
    }

    async fn update_log_path(&self, id: &str, path: &str) -> Result<()> {
        let changed = sqlx::query("UPDATE backup_records SET log_file_path = ? WHERE id = ?")
            .bind(path)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if changed == 0 {
            return Err(AppError::record_not_found(id));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<BackupRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_record(&mut conn, id).await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>> {
        filter.validate()?;
        let mut tx = self.pool.begin().await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM backup_records WHERE 1 = 1",
            RECORD_COLUMNS
        ));
        push_filters(&mut qb, filter, None);
        push_order(&mut qb, SortOrder::NewestFirst);
        let rows: Vec<RecordRow> = qb.build_query_as().fetch_all(&mut *tx).await?;

        let records = hydrate(&mut tx, rows).await?;
        tx.commit().await?;
        Ok(records)
    }

    async fn mark_deleted(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            "UPDATE backup_records SET status = 'deleted' \
             WHERE id = ? AND status IN ('success', 'error')",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if changed == 0 {
            return match current_status(&mut tx, id).await? {
                None => Err(AppError::record_not_found(id)),
                Some(status) => {
                    tracing::debug!(id = %id, status = %status, "mark_deleted ignored");
                    Ok(false)
                }
            };
        }

        recompute_stats(&mut tx, Utc::now()).await?;
        tx.commit().await?;
        tracing::info!(id = %id, "Backup record marked deleted");
        Ok(true)
    }

    async fn purge_deleted(&self, older_than: Duration) -> Result<u64> {
        let cutoff = purge_cutoff(older_than)?;
        let mut tx = self.pool.begin().await?;

        for table in [ChildTable::LocalPaths, ChildTable::S3Keys] {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE backup_id IN (\
                 SELECT id FROM backup_records \
                 WHERE status = 'deleted' AND COALESCE(completed_at, created_at) < ?)",
                table.table()
            ))
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        }

        let purged = sqlx::query(
            "DELETE FROM backup_records \
             WHERE status = 'deleted' AND COALESCE(completed_at, created_at) < ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if purged > 0 {
            recompute_stats(&mut tx, Utc::now()).await?;
        }
        tx.commit().await?;

        if purged > 0 {
            tracing::info!(purged, "Purged deleted backup records");
        }
        Ok(purged)
    }

    async fn stats(&self) -> Result<AggregateStats> {
        let mut tx = self.pool.begin().await?;
        let row: StatsRow = sqlx::query_as(
            "SELECT total_records, total_local_size, total_s3_size, updated_at \
             FROM backup_stats WHERE id = 1",
        )
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::Corruption("backup_stats row is missing".into()))?;

        let stats = AggregateStats {
            total_records: row.total_records.max(0) as u64,
            total_local_size: row.total_local_size.max(0) as u64,
            total_s3_size: row.total_s3_size.max(0) as u64,
            by_status: group_counts(&mut tx, "status").await?,
            by_type: group_counts(&mut tx, "backup_type").await?,
            by_server: group_counts(&mut tx, "server_name").await?,
            by_database: group_counts(&mut tx, "database_name").await?,
            last_updated: row.updated_at,
        };
        tx.commit().await?;
        Ok(stats)
    }

    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        Ok(())
    }

    fn paginated(&self) -> Option<&dyn PaginatedQuery> {
        Some(self)
    }
}

#[async_trait]
impl PaginatedQuery for SqlStore {
    async fn query_page(&self, query: &ListQuery) -> Result<Page<BackupRecord>> {
        query.validate()?;
        let mut tx = self.pool.begin().await?;

        let mut count_qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM backup_records WHERE 1 = 1");
        push_filters(&mut count_qb, &query.filter, query.status);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&mut *tx).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM backup_records WHERE 1 = 1",
            RECORD_COLUMNS
        ));
        push_filters(&mut qb, &query.filter, query.status);
        push_order(&mut qb, query.sort);
        qb.push(" LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(query.offset));
        let rows: Vec<RecordRow> = qb.build_query_as().fetch_all(&mut *tx).await?;

        let items = hydrate(&mut tx, rows).await?;
        tx.commit().await?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            limit: query.limit,
            offset: query.offset,
        })
    }
}

impl SqlStore {
    /// Insert a fresh record; `Some(existing)` when the id is taken.
    async fn try_create(&self, record: &BackupRecord) -> Result<Option<BackupRecord>> {
        let mut tx = self.pool.begin().await?;
        if !insert_record(&mut tx, record).await? {
            let existing = fetch_record(&mut tx, &record.id).await?;
            tx.commit().await?;
            return Ok(existing);
        }
        recompute_stats(&mut tx, Utc::now()).await?;
        tx.commit().await?;
        Ok(None)
    }
}

fn size_to_db(size: u64) -> Result<i64> {
    check_size(size)?;
    Ok(size as i64)
}

fn push_filters(
    qb: &mut QueryBuilder<'_, Sqlite>,
    filter: &RecordFilter,
    status: Option<BackupStatus>,
) {
    if let Some(server) = &filter.server {
        qb.push(" AND server_name = ").push_bind(server.clone());
    }
    if let Some(database) = &filter.database {
        qb.push(" AND database_name = ").push_bind(database.clone());
    }
    if let Some(backup_type) = filter.backup_type {
        qb.push(" AND backup_type = ").push_bind(backup_type.as_str());
    }
    if filter.active_only {
        qb.push(" AND status != 'deleted'");
    }
    if let Some(status) = status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
}

fn push_order(qb: &mut QueryBuilder<'_, Sqlite>, order: SortOrder) {
    qb.push(match order {
        SortOrder::NewestFirst => " ORDER BY created_at DESC, id DESC",
        SortOrder::OldestFirst => " ORDER BY created_at ASC, id ASC",
    });
}

/// Insert one record and its child maps. Returns `false` if the id exists.
async fn insert_record(conn: &mut SqliteConnection, record: &BackupRecord) -> Result<bool> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO backup_records (
            id, server_name, server_type, database_name, backup_type,
            created_at, completed_at, size, status, error_message,
            s3_upload_status, s3_upload_error, s3_upload_completed_at,
            retention_policy, expires_at, log_file_path
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(&record.id)
    .bind(&record.server_name)
    .bind(&record.server_type)
    .bind(&record.database)
    .bind(record.backup_type.as_str())
    .bind(record.created_at)
    .bind(record.completed_at)
    .bind(size_to_db(record.size)?)
    .bind(record.status.as_str())
    .bind(&record.error_message)
    .bind(record.s3_upload_status.map(|s| s.as_str()))
    .bind(&record.s3_upload_error)
    .bind(record.s3_upload_completed_at)
    .bind(&record.retention_policy)
    .bind(record.expires_at)
    .bind(&record.log_file_path)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted == 0 {
        return Ok(false);
    }
    insert_child_map(conn, ChildTable::LocalPaths, &record.id, &record.local_paths).await?;
    insert_child_map(conn, ChildTable::S3Keys, &record.id, &record.s3_keys).await?;
    Ok(true)
}

async fn insert_child_map(
    conn: &mut SqliteConnection,
    table: ChildTable,
    id: &str,
    map: &PathMap,
) -> Result<()> {
    for (organization, value) in map {
        sqlx::query(&format!(
            "INSERT INTO {} (backup_id, organization, {}) VALUES (?, ?, ?)",
            table.table(),
            table.value_column()
        ))
        .bind(id)
        .bind(organization)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn replace_child_map(
    conn: &mut SqliteConnection,
    table: ChildTable,
    id: &str,
    map: &PathMap,
) -> Result<()> {
    sqlx::query(&format!("DELETE FROM {} WHERE backup_id = ?", table.table()))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    insert_child_map(conn, table, id, map).await
}

async fn current_status(conn: &mut SqliteConnection, id: &str) -> Result<Option<BackupStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM backup_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
    status
        .map(|s| {
            s.parse()
                .map_err(|e: String| AppError::Corruption(format!("status of {}: {}", id, e)))
        })
        .transpose()
}

async fn fetch_record(conn: &mut SqliteConnection, id: &str) -> Result<Option<BackupRecord>> {
    let row: Option<RecordRow> = sqlx::query_as(&format!(
        "SELECT {} FROM backup_records WHERE id = ?",
        RECORD_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(hydrate(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

/// Attach child maps to rows, preserving row order.
async fn hydrate(conn: &mut SqliteConnection, rows: Vec<RecordRow>) -> Result<Vec<BackupRecord>> {
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let mut local = load_child_maps(conn, ChildTable::LocalPaths, &ids).await?;
    let mut s3 = load_child_maps(conn, ChildTable::S3Keys, &ids).await?;

    rows.into_iter()
        .map(|row| {
            let local_paths = local.remove(&row.id).unwrap_or_default();
            let s3_keys = s3.remove(&row.id).unwrap_or_default();
            row.into_record(local_paths, s3_keys)
        })
        .collect()
}

async fn load_child_maps(
    conn: &mut SqliteConnection,
    table: ChildTable,
    ids: &[String],
) -> Result<HashMap<String, PathMap>> {
    let mut maps: HashMap<String, PathMap> = HashMap::new();
    for chunk in ids.chunks(ID_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT backup_id, organization, {} AS value FROM {} WHERE backup_id IN (",
            table.value_column(),
            table.table()
        ));
        let mut separated = qb.separated(", ");
        for id in chunk {
            separated.push_bind(id.clone());
        }
        qb.push(")");

        let rows: Vec<ChildRow> = qb.build_query_as().fetch_all(&mut *conn).await?;
        for row in rows {
            maps.entry(row.backup_id)
                .or_default()
                .insert(row.organization, row.value);
        }
    }
    Ok(maps)
}

/// Rewrite the singleton stats row from the record rows.
async fn recompute_stats(conn: &mut SqliteConnection, now: DateTime<Utc>) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE backup_stats SET
            total_records = (SELECT COUNT(*) FROM backup_records),
            total_local_size = (
                SELECT COALESCE(SUM(size), 0) FROM backup_records WHERE status = 'success'
            ),
            total_s3_size = (
                SELECT COALESCE(SUM(size), 0) FROM backup_records WHERE s3_upload_status = 'success'
            ),
            updated_at = ?
        WHERE id = 1
        "#,
    )
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated != 1 {
        return Err(AppError::Corruption("backup_stats row is missing".into()));
    }
    Ok(())
}

/// `column` must be one of the fixed grouping columns.
async fn group_counts(
    conn: &mut SqliteConnection,
    column: &'static str,
) -> Result<BTreeMap<String, u64>> {
    let rows: Vec<GroupCount> = sqlx::query_as(&format!(
        "SELECT {col} AS name, COUNT(*) AS total FROM backup_records GROUP BY {col}",
        col = column
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.name, r.total.max(0) as u64))
        .collect())
}
