//! Artifact discovery backends.
//!
//! A source lists the dump files it can see, together with the
//! organization tag of the path they were found under. Sources never parse
//! file names; that is the recovery scanner's job.

pub mod filesystem;
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::error::Result;
use crate::models::backup::DEFAULT_ORGANIZATION;

pub use filesystem::FilesystemSource;
pub use s3::S3Source;

/// Prefix of directory names that denote an organization strategy.
pub const ORGANIZATION_DIR_PREFIX: &str = "by-";

/// Where a discovered object lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLocation {
    Local(PathBuf),
    Remote(String),
}

impl ObjectLocation {
    pub fn is_local(&self) -> bool {
        matches!(self, ObjectLocation::Local(_))
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectLocation::Local(path) => write!(f, "{}", path.display()),
            ObjectLocation::Remote(key) => write!(f, "s3://{}", key),
        }
    }
}

/// One file seen by a source.
#[derive(Debug, Clone)]
pub struct DiscoveredObject {
    pub location: ObjectLocation,
    pub organization: String,
    /// Final path component.
    pub file_name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Everything one source found, plus the entries it could not read.
#[derive(Debug, Default)]
pub struct Discovery {
    pub objects: Vec<DiscoveredObject>,
    pub errors: Vec<String>,
}

/// Lists candidate artifacts in one storage location
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Short name for logs and reports ("local", "s3").
    fn name(&self) -> &'static str;

    /// List every file under the source root. Unreadable entries are
    /// reported in `Discovery::errors`; only a failure to list at all is an
    /// error.
    async fn discover(&self) -> Result<Discovery>;
}

/// Organization tag for a `/`-separated path relative to a source root:
/// the first component when it is a `by-*` directory, `default` otherwise.
pub fn organization_for(relative: &str) -> String {
    let mut components = relative.split('/').filter(|c| !c.is_empty());
    match (components.next(), components.next()) {
        (Some(first), Some(_)) if first.starts_with(ORGANIZATION_DIR_PREFIX) => first.to_string(),
        _ => DEFAULT_ORGANIZATION.to_string(),
    }
}

/// Final component of a `/`-separated path.
pub(crate) fn file_name_of(relative: &str) -> &str {
    relative.rsplit('/').next().unwrap_or(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_organization_for() {
        assert_eq!(
            organization_for("by-server/s1/s1-db1-daily-20250101-020000.sql.gz"),
            "by-server"
        );
        assert_eq!(organization_for("by-type/daily/x.sql.gz"), "by-type");
        assert_eq!(organization_for("x.sql.gz"), "default");
        assert_eq!(organization_for("daily/x.sql.gz"), "default");
        // A file literally named by-something is not an organization.
        assert_eq!(organization_for("by-server"), "default");
    }

    #[test]
    fn test_file_name_of() {
        assert_eq!(file_name_of("a/b/c.sql.gz"), "c.sql.gz");
        assert_eq!(file_name_of("c.sql.gz"), "c.sql.gz");
    }
}
