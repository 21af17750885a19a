//! Recovery scanner end to end: real files on disk plus a bucket listing.
//!
//! ```sh
//! cargo test --test recovery_tests
//! ```

mod common;

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;

use common::fixtures::{write_artifact, FakeBucket, ARTIFACT, ARTIFACT_ID};
use common::{assert_totals_consistent, both_stores, file_store};
use dump_keeper_backend::models::{BackupStatus, RecordFilter, UploadStatus};
use dump_keeper_backend::services::migration_service::migrate_file_to_sql;
use dump_keeper_backend::services::recovery_service::{
    RecoveryOptions, RecoveryService, RECOVERED_SERVER_TYPE,
};
use dump_keeper_backend::services::{FileStore, MetadataStore, SqlStore};
use dump_keeper_backend::storage::FilesystemSource;

fn uploaded_at() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 2, 30, 0).unwrap()
}

#[tokio::test]
async fn test_local_and_remote_sightings_become_one_record() {
    for t in both_stores().await {
        let dumps = TempDir::new().unwrap();
        write_artifact(dumps.path(), &format!("by-server/s1/{}", ARTIFACT), 2048);
        write_artifact(dumps.path(), &format!("by-type/daily/{}", ARTIFACT), 2048);
        let bucket = FakeBucket::new().with_object(
            &format!("by-server/s1/{}", ARTIFACT),
            2048,
            uploaded_at(),
        );

        let service = RecoveryService::new(Arc::clone(&t.store))
            .with_local_source(Box::new(FilesystemSource::new(dumps.path())))
            .with_remote_source(Box::new(bucket));
        let report = service.run(&RecoveryOptions::default()).await.unwrap();

        assert_eq!(report.discovered, 3, "{}", t.name());
        assert_eq!(report.duplicates_merged, 2);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.failed, 0, "{:?}", report.failures);

        let record = t.store.get(ARTIFACT_ID).await.unwrap().unwrap();
        assert_eq!(record.server_name, "s1");
        assert_eq!(record.database, "db1");
        assert_eq!(record.server_type, RECOVERED_SERVER_TYPE);
        assert_eq!(record.status, BackupStatus::Success);
        assert_eq!(record.size, 2048);
        assert_eq!(
            record.created_at,
            Utc.with_ymd_and_hms(2025, 1, 1, 2, 0, 0).unwrap()
        );
        assert_eq!(record.local_paths.len(), 2);
        assert!(record.local_paths["by-server"].ends_with(ARTIFACT));
        assert!(record.local_paths["by-type"].ends_with(ARTIFACT));
        assert_eq!(record.s3_upload_status, Some(UploadStatus::Success));
        assert_eq!(
            record.s3_keys.get("by-server").map(String::as_str),
            Some(format!("backups/by-server/s1/{}", ARTIFACT).as_str())
        );
        assert_totals_consistent(t.store.as_ref()).await;
    }
}

#[tokio::test]
async fn test_unrecognised_names_are_skipped() {
    for t in both_stores().await {
        let dumps = TempDir::new().unwrap();
        write_artifact(dumps.path(), "s1-db1-daily-2025-01-01.sql.gz", 10);
        write_artifact(dumps.path(), "README.txt", 10);
        write_artifact(dumps.path(), ARTIFACT, 10);

        let service = RecoveryService::new(Arc::clone(&t.store))
            .with_local_source(Box::new(FilesystemSource::new(dumps.path())));
        let report = service
            .run(&RecoveryOptions {
                scan_remote: false,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.discovered, 3);
        assert_eq!(report.unmatched, 2);
        assert_eq!(report.recovered, 1);

        let records = t.store.list(&RecordFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1, "{}", t.name());
        assert_eq!(records[0].id, ARTIFACT_ID);
        assert_eq!(
            records[0].local_paths.keys().next().map(String::as_str),
            Some("default")
        );
    }
}

#[tokio::test]
async fn test_merge_is_idempotent() {
    for t in both_stores().await {
        let dumps = TempDir::new().unwrap();
        write_artifact(dumps.path(), ARTIFACT, 64);
        write_artifact(dumps.path(), "s2-app-hourly-20250101-030000.sql.gz", 32);

        let service = RecoveryService::new(Arc::clone(&t.store))
            .with_local_source(Box::new(FilesystemSource::new(dumps.path())));
        let merge = RecoveryOptions {
            merge: true,
            scan_remote: false,
            ..Default::default()
        };

        let first = service.run(&merge).await.unwrap();
        assert_eq!(first.recovered, 2);
        let before = t.store.stats().await.unwrap();

        let second = service.run(&merge).await.unwrap();
        assert_eq!(second.recovered, 0, "{}", t.name());
        assert_eq!(second.skipped_existing, 2);
        let after = t.store.stats().await.unwrap();
        assert_eq!(before.totals(), after.totals());
        assert_eq!(after.totals(), (2, 96, 0));
    }
}

#[tokio::test]
async fn test_unreachable_bucket_is_reported() {
    for t in both_stores().await {
        let dumps = TempDir::new().unwrap();
        write_artifact(dumps.path(), ARTIFACT, 64);

        let service = RecoveryService::new(Arc::clone(&t.store))
            .with_local_source(Box::new(FilesystemSource::new(dumps.path())))
            .with_remote_source(Box::new(FakeBucket::unreachable()));
        let report = service.run(&RecoveryOptions::default()).await.unwrap();

        assert_eq!(report.recovered, 1);
        assert_eq!(report.failed, 1, "{}", t.name());
        assert!(report.failures[0].starts_with("s3:"));
        let record = t.store.get(ARTIFACT_ID).await.unwrap().unwrap();
        assert!(record.s3_keys.is_empty());
    }
}

#[tokio::test]
async fn test_missing_backup_dir_is_reported() {
    let t = file_store().await;
    let service = RecoveryService::new(Arc::clone(&t.store))
        .with_local_source(Box::new(FilesystemSource::new("/nonexistent/dump-keeper/dumps")));
    let report = service
        .run(&RecoveryOptions {
            scan_remote: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.discovered, 0);
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].starts_with("local:"));
}

#[tokio::test]
async fn test_recovered_file_store_migrates_to_sql() {
    let dumps = TempDir::new().unwrap();
    write_artifact(dumps.path(), &format!("by-server/s1/{}", ARTIFACT), 128);
    write_artifact(dumps.path(), "s2-app-weekly-20250105-000000.sql.gz", 256);

    let meta = TempDir::new().unwrap();
    let file = Arc::new(
        FileStore::open(
            meta.path().join("backup-metadata.json"),
            Arc::new(Default::default()),
        )
        .await
        .unwrap(),
    );
    RecoveryService::new(file.clone())
        .with_local_source(Box::new(FilesystemSource::new(dumps.path())))
        .run(&RecoveryOptions::default())
        .await
        .unwrap();

    let sql = SqlStore::connect("sqlite::memory:", Arc::new(Default::default()))
        .await
        .unwrap();

    let report = migrate_file_to_sql(&file, &sql).await.unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.migrated, 2);

    let migrated = sql.get(ARTIFACT_ID).await.unwrap().unwrap();
    let original = file.get(ARTIFACT_ID).await.unwrap().unwrap();
    assert_eq!(migrated.local_paths, original.local_paths);
    assert_eq!(migrated.size, original.size);
    assert_eq!(migrated.status, original.status);
    assert_eq!(
        sql.stats().await.unwrap().totals(),
        file.stats().await.unwrap().totals()
    );
}
