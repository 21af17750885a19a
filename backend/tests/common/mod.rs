//! Common test utilities for store and recovery integration tests
//!
//! Every test that exercises the store interface runs against both
//! backends: the JSON file store in a temp directory and the SQLite store
//! in memory.

#![allow(dead_code)]
#![allow(unused_imports)]

pub mod fixtures;

use std::sync::Arc;
use tempfile::TempDir;

use dump_keeper_backend::models::{AggregateStats, RecordFilter};
use dump_keeper_backend::services::retention_service::RetentionConfig;
use dump_keeper_backend::services::{FileStore, MetadataStore, SqlStore};

/// A store plus whatever keeps its backing storage alive.
pub struct TestStore {
    pub store: Arc<dyn MetadataStore>,
    _temp: Option<TempDir>,
}

impl TestStore {
    pub fn name(&self) -> &'static str {
        self.store.backend_name()
    }
}

pub async fn file_store() -> TestStore {
    let temp = TempDir::new().expect("temp dir");
    let store = FileStore::open(
        temp.path().join("backup-metadata.json"),
        Arc::new(RetentionConfig::default()),
    )
    .await
    .expect("open file store");
    TestStore {
        store: Arc::new(store),
        _temp: Some(temp),
    }
}

pub async fn sql_store() -> TestStore {
    let store = SqlStore::connect("sqlite::memory:", Arc::new(RetentionConfig::default()))
        .await
        .expect("connect sqlite");
    TestStore {
        store: Arc::new(store),
        _temp: None,
    }
}

pub async fn both_stores() -> Vec<TestStore> {
    vec![file_store().await, sql_store().await]
}

/// Assert the reported totals match a full scan of the records.
pub async fn assert_totals_consistent(store: &dyn MetadataStore) {
    let records = store
        .list(&RecordFilter::default())
        .await
        .expect("list records");
    let expected = AggregateStats::from_records(&records);
    let actual = store.stats().await.expect("stats");
    assert_eq!(
        actual.totals(),
        expected.totals(),
        "{} totals drifted from records",
        store.backend_name()
    );
    assert_eq!(actual.by_status, expected.by_status);
}
