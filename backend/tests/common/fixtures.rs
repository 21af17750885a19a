//! Test fixtures: artifact trees on disk and an in-memory bucket listing.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

use dump_keeper_backend::error::{AppError, Result};
use dump_keeper_backend::storage::{
    organization_for, ArtifactSource, DiscoveredObject, Discovery, ObjectLocation,
};

pub const ARTIFACT: &str = "s1-db1-daily-20250101-020000.sql.gz";
pub const ARTIFACT_ID: &str = "s1-db1-daily-20250101-020000";

/// Write `size` bytes at `root/relative`, creating directories.
pub fn write_artifact(root: &Path, relative: &str, size: usize) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create artifact dir");
    }
    std::fs::write(&path, vec![0u8; size]).expect("write artifact");
}

/// A bucket listing held in memory.
#[derive(Default)]
pub struct FakeBucket {
    objects: Vec<DiscoveredObject>,
    unreachable: bool,
}

impl FakeBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        Self {
            objects: Vec::new(),
            unreachable: true,
        }
    }

    /// Add an object under `prefix/relative`.
    pub fn with_object(mut self, relative: &str, size: u64, modified: DateTime<Utc>) -> Self {
        let file_name = relative.rsplit('/').next().unwrap_or(relative).to_string();
        self.objects.push(DiscoveredObject {
            location: ObjectLocation::Remote(format!("backups/{}", relative)),
            organization: organization_for(relative),
            file_name,
            size,
            modified: Some(modified),
        });
        self
    }
}

#[async_trait]
impl ArtifactSource for FakeBucket {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn discover(&self) -> Result<Discovery> {
        if self.unreachable {
            return Err(AppError::Storage("connection refused".into()));
        }
        Ok(Discovery {
            objects: self.objects.clone(),
            errors: Vec::new(),
        })
    }
}
