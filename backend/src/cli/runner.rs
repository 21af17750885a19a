//! CLI command runner.
//!
//! Opens the configured store and executes one command against it.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cli::commands::{output, table_row, Cli, Command};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::backup::BackupRecord;
use crate::models::query::{ListQuery, RecordFilter, SortOrder};
use crate::services::file_store::FileStore;
use crate::services::metadata_store::{list_page, MetadataStore};
use crate::services::migration_service::migrate_file_to_sql;
use crate::services::recovery_service::{RecoveryOptions, RecoveryService};
use crate::services::retention_service::{RetentionConfig, RetentionService};
use crate::services::sql_store::SqlStore;
use crate::services::store_factory::open_store;
use crate::storage::{FilesystemSource, S3Source};

/// Build the configuration, letting command-line flags win over the
/// environment.
pub fn load_config(cli: &Cli) -> Result<Config> {
    let flag = |value: &Option<std::path::PathBuf>| {
        value.as_ref().map(|p| p.to_string_lossy().into_owned())
    };
    Config::from_lookup(|key| match key {
        "DATABASE_URL" => cli.database_url.clone(),
        "BACKUP_DIR" => flag(&cli.backup_dir),
        "METADATA_FILE" => flag(&cli.metadata_file),
        "RETENTION_CONFIG" => flag(&cli.retention_config),
        "LOG_LEVEL" => cli.log_level.clone(),
        _ => std::env::var(key).ok(),
    })
}

async fn load_retention(config: &Config) -> Result<Arc<RetentionConfig>> {
    let retention = match &config.retention_config {
        Some(path) => RetentionConfig::from_file(path).await?,
        None => RetentionConfig::default(),
    };
    Ok(Arc::new(retention))
}

/// Run the CLI command
pub async fn run(cli: Cli, config: Config) -> Result<()> {
    let format = cli.format.as_str();
    let retention = load_retention(&config).await?;

    match cli.command {
        Command::Migrate => run_migrate(format, &config, retention).await,
        Command::Recover {
            dry_run,
            verbose,
            no_local,
            no_remote,
            force,
            merge,
        } => {
            let options = RecoveryOptions {
                dry_run,
                verbose,
                scan_local: !no_local,
                scan_remote: !no_remote,
                force,
                merge,
            };
            let store = open_store(&config, retention).await?;
            run_recover(format, &config, store, &options).await
        }
        Command::List {
            server,
            database,
            backup_type,
            status,
            active_only,
            oldest_first,
            limit,
            offset,
        } => {
            let query = ListQuery {
                filter: RecordFilter {
                    server,
                    database,
                    backup_type,
                    active_only,
                },
                status,
                sort: if oldest_first {
                    SortOrder::OldestFirst
                } else {
                    SortOrder::NewestFirst
                },
                limit,
                offset,
            };
            let store = open_store(&config, retention).await?;
            run_list(format, store.as_ref(), &query).await
        }
        Command::Show { id } => {
            let store = open_store(&config, retention).await?;
            run_show(format, store.as_ref(), &id).await
        }
        Command::Stats => {
            let store = open_store(&config, retention).await?;
            run_stats(format, store.as_ref()).await
        }
        Command::Expire { grace } => {
            let store = open_store(&config, retention).await?;
            let grace = grace.unwrap_or(config.purge_grace_period);
            let report = RetentionService::enforce(store.as_ref(), Utc::now(), grace).await?;
            output(
                format,
                &format!(
                    "Expired {} records, purged {} deleted records, {} failures",
                    report.expired,
                    report.purged,
                    report.failures.len()
                ),
                Some(serde_json::to_value(&report)?),
            );
            Ok(())
        }
    }
}

async fn run_migrate(format: &str, config: &Config, retention: Arc<RetentionConfig>) -> Result<()> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| AppError::Config("DATABASE_URL is required for migrate".into()))?;
    let file = FileStore::open(&config.metadata_file, retention.clone()).await?;
    let sql = SqlStore::connect(url, retention).await?;
    let report = migrate_file_to_sql(&file, &sql).await?;
    output(
        format,
        &format!(
            "Migrated {} of {} records ({} already present)",
            report.migrated, report.total, report.skipped
        ),
        Some(serde_json::to_value(&report)?),
    );
    Ok(())
}

async fn run_recover(
    format: &str,
    config: &Config,
    store: Arc<dyn MetadataStore>,
    options: &RecoveryOptions,
) -> Result<()> {
    let cancel_token = CancellationToken::new();
    let mut service = RecoveryService::new(store)
        .with_completion_estimate(config.recovery_completion_estimate)
        .with_cancel_token(cancel_token.clone());

    if options.scan_local {
        service = service.with_local_source(Box::new(FilesystemSource::new(&config.backup_dir)));
    }
    if options.scan_remote {
        match &config.s3 {
            Some(settings) => {
                service = service.with_remote_source(Box::new(S3Source::new(settings)?))
            }
            None => tracing::info!("S3_BUCKET not set; skipping remote scan"),
        }
    }

    let interrupt = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current artifact");
            interrupt.cancel();
        }
    });

    let report = service.run(options).await?;
    cancel_token.cancel();

    if format == "text" {
        let prefix = if report.dry_run { "[dry run] " } else { "" };
        println!("{}Discovered {} files", prefix, report.discovered);
        println!("  unrecognised names: {}", report.unmatched);
        println!("  merged sightings:   {}", report.duplicates_merged);
        println!("  recovered:          {}", report.recovered);
        println!("  already present:    {}", report.skipped_existing);
        println!("  failed:             {}", report.failed);
        for failure in &report.failures {
            println!("    {}", failure);
        }
        if report.cancelled {
            println!("Recovery was interrupted before all artifacts were processed");
        }
        return Ok(());
    }
    output(format, "", Some(serde_json::to_value(&report)?));
    Ok(())
}

async fn run_list(format: &str, store: &dyn MetadataStore, query: &ListQuery) -> Result<()> {
    let page = list_page(store, query).await?;
    if format == "json" {
        output(format, "", Some(serde_json::to_value(&page)?));
        return Ok(());
    }

    table_row(&["ID", "STATUS", "SIZE", "CREATED", "S3"]);
    for record in &page.items {
        let size = record.size.to_string();
        let created = record.created_at.format("%Y-%m-%d %H:%M:%S").to_string();
        let s3 = record
            .s3_upload_status
            .map(|s| s.as_str())
            .unwrap_or("-");
        table_row(&[
            record.id.as_str(),
            record.status.as_str(),
            size.as_str(),
            created.as_str(),
            s3,
        ]);
    }
    println!(
        "\nShowing {} of {} records (offset {})",
        page.items.len(),
        page.total,
        page.offset
    );
    Ok(())
}

async fn run_show(format: &str, store: &dyn MetadataStore, id: &str) -> Result<()> {
    let record = store
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Backup record {}", id)))?;
    output(format, &describe_record(&record), Some(serde_json::to_value(&record)?));
    Ok(())
}

fn describe_record(record: &BackupRecord) -> String {
    let mut lines = vec![
        format!("ID:          {}", record.id),
        format!(
            "Server:      {} ({})",
            record.server_name, record.server_type
        ),
        format!("Database:    {}", record.database),
        format!("Type:        {}", record.backup_type),
        format!("Status:      {}", record.status),
        format!("Size:        {}", record.size),
        format!("Created:     {}", record.created_at.to_rfc3339()),
    ];
    if let Some(at) = record.completed_at {
        lines.push(format!("Completed:   {}", at.to_rfc3339()));
    }
    if let Some(message) = &record.error_message {
        lines.push(format!("Error:       {}", message));
    }
    for (organization, path) in &record.local_paths {
        lines.push(format!("Local [{}]: {}", organization, path));
    }
    if let Some(status) = record.s3_upload_status {
        lines.push(format!("S3 upload:   {}", status));
    }
    for (organization, key) in &record.s3_keys {
        lines.push(format!("S3 [{}]:    {}", organization, key));
    }
    lines.push(format!("Retention:   {}", record.retention_policy));
    if let Some(at) = record.expires_at {
        lines.push(format!("Expires:     {}", at.to_rfc3339()));
    }
    if let Some(path) = &record.log_file_path {
        lines.push(format!("Log:         {}", path));
    }
    lines.join("\n")
}

async fn run_stats(format: &str, store: &dyn MetadataStore) -> Result<()> {
    let stats = store.stats().await?;
    let mut lines = vec![
        format!("Backend:          {}", store.backend_name()),
        format!("Records:          {}", stats.total_records),
        format!("Local bytes:      {}", stats.total_local_size),
        format!("S3 bytes:         {}", stats.total_s3_size),
    ];
    for (status, count) in &stats.by_status {
        lines.push(format!("  {:<15} {}", status, count));
    }
    for (backup_type, count) in &stats.by_type {
        lines.push(format!("  {:<15} {}", backup_type, count));
    }
    output(format, &lines.join("\n"), Some(serde_json::to_value(&stats)?));
    Ok(())
}
