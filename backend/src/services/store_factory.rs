//! Metadata backend selection.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::services::file_store::FileStore;
use crate::services::metadata_store::MetadataStore;
use crate::services::migration_service::migrate_file_to_sql;
use crate::services::retention_service::RetentionConfig;
use crate::services::sql_store::SqlStore;

/// Open the configured metadata store.
///
/// The relational store is used when `DATABASE_URL` is set and reachable;
/// otherwise the JSON file store. A legacy JSON file next to a working
/// relational store is migrated on every open (a no-op once done).
pub async fn open_store(
    config: &Config,
    retention: Arc<RetentionConfig>,
) -> Result<Arc<dyn MetadataStore>> {
    if let Some(url) = config.database_url.as_deref() {
        match SqlStore::connect(url, retention.clone()).await {
            Ok(sql) => {
                if tokio::fs::try_exists(&config.metadata_file)
                    .await
                    .unwrap_or(false)
                {
                    migrate_legacy_file(config, retention, &sql).await;
                }
                return Ok(Arc::new(sql));
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    fallback = %config.metadata_file.display(),
                    "Relational metadata store unavailable; falling back to file store"
                );
            }
        }
    }

    let file = FileStore::open(&config.metadata_file, retention).await?;
    Ok(Arc::new(file))
}

async fn migrate_legacy_file(config: &Config, retention: Arc<RetentionConfig>, sql: &SqlStore) {
    let file = match FileStore::open(&config.metadata_file, retention).await {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(
                path = %config.metadata_file.display(),
                error = %e,
                "Cannot read legacy metadata file; skipping migration"
            );
            return;
        }
    };
    if let Err(e) = migrate_file_to_sql(&file, sql).await {
        tracing::error!(error = %e, "Legacy metadata migration failed; relational store unchanged");
    }
}
