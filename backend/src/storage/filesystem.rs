//! Local backup directory source.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{organization_for, ArtifactSource, DiscoveredObject, Discovery, ObjectLocation};
use crate::error::{AppError, Result};

/// Walks the local backup tree
#[derive(Debug, Clone)]
pub struct FilesystemSource {
    base_path: PathBuf,
}

impl FilesystemSource {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Path relative to the root, `/`-separated.
    fn relative_key(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.base_path).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Blocking walk; run on the blocking pool.
    fn walk(&self) -> Result<Discovery> {
        let root = std::fs::metadata(&self.base_path).map_err(|e| {
            AppError::Storage(format!(
                "Cannot read backup directory {}: {}",
                self.base_path.display(),
                e
            ))
        })?;
        if !root.is_dir() {
            return Err(AppError::Storage(format!(
                "{} is not a directory",
                self.base_path.display()
            )));
        }

        let mut discovery = Discovery::default();
        for entry in WalkDir::new(&self.base_path) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable backup directory entry");
                    discovery.errors.push(e.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    discovery
                        .errors
                        .push(format!("{}: {}", entry.path().display(), e));
                    continue;
                }
            };
            let relative = self.relative_key(entry.path());
            discovery.objects.push(DiscoveredObject {
                organization: organization_for(&relative),
                file_name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                location: ObjectLocation::Local(entry.into_path()),
            });
        }
        Ok(discovery)
    }
}

#[async_trait]
impl ArtifactSource for FilesystemSource {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn discover(&self) -> Result<Discovery> {
        let source = self.clone();
        let discovery = tokio::task::spawn_blocking(move || source.walk())
            .await
            .map_err(|e| AppError::Internal(format!("Directory scan task failed: {}", e)))??;

        tracing::debug!(
            root = %self.base_path.display(),
            found = discovery.objects.len(),
            errors = discovery.errors.len(),
            "Scanned local backup directory"
        );
        Ok(discovery)
    }
}
