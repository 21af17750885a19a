//! Backup metadata models.

pub mod backup;
pub mod query;
pub mod stats;

pub use backup::{
    BackupRecord, BackupStatus, BackupType, LocalUpdate, NewRecord, PathMap, RemoteUpdate,
    UploadStatus,
};
pub use query::{ListQuery, Page, RecordFilter, SortOrder};
pub use stats::AggregateStats;
