//! Application configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};

/// File name of the JSON metadata document inside the backup directory.
pub const DEFAULT_METADATA_FILE_NAME: &str = "backup-metadata.json";

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the local backup tree
    pub backup_dir: PathBuf,

    /// JSON metadata document (file-backed store, and legacy source for migration)
    pub metadata_file: PathBuf,

    /// Relational store URL (e.g. `sqlite:///var/lib/dump-keeper/metadata.db`)
    pub database_url: Option<String>,

    /// Log level
    pub log_level: String,

    /// Object storage settings; `None` disables remote scanning
    pub s3: Option<S3Settings>,

    /// YAML file with per-backup-type retention rules
    pub retention_config: Option<PathBuf>,

    /// Estimated dump duration used to fill `completed_at` for recovered artifacts
    pub recovery_completion_estimate: Duration,

    /// How long deleted records are kept before they are purged
    pub purge_grace_period: Duration,
}

/// S3 bucket used for remote copies
#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint URL (for MinIO or other S3-compatible services)
    pub endpoint: Option<String>,
    /// Key prefix under which artifacts are uploaded
    pub prefix: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

redacted_debug!(S3Settings {
    show bucket,
    show region,
    show endpoint,
    show prefix,
    show access_key,
    redact_option secret_key,
});

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backup_dir = PathBuf::from(
            lookup("BACKUP_DIR").unwrap_or_else(|| "/var/backups/databases".into()),
        );
        let metadata_file = lookup("METADATA_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| backup_dir.join(DEFAULT_METADATA_FILE_NAME));

        let s3 = lookup("S3_BUCKET").map(|bucket| S3Settings {
            bucket,
            region: lookup("S3_REGION").unwrap_or_else(|| "us-east-1".into()),
            endpoint: lookup("S3_ENDPOINT"),
            prefix: lookup("S3_PREFIX"),
            access_key: lookup("S3_ACCESS_KEY_ID"),
            secret_key: lookup("S3_SECRET_ACCESS_KEY"),
        });

        Ok(Self {
            backup_dir,
            metadata_file,
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            s3,
            retention_config: lookup("RETENTION_CONFIG").map(PathBuf::from),
            recovery_completion_estimate: parse_duration_var(
                "RECOVERY_COMPLETION_ESTIMATE",
                lookup("RECOVERY_COMPLETION_ESTIMATE"),
                Duration::from_secs(5 * 60),
            )?,
            purge_grace_period: parse_duration_var(
                "PURGE_GRACE_PERIOD",
                lookup("PURGE_GRACE_PERIOD"),
                Duration::from_secs(24 * 60 * 60),
            )?,
        })
    }
}

fn parse_duration_var(name: &str, value: Option<String>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(raw.trim())
            .map_err(|e| AppError::Config(format!("{} is not a valid duration: {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.backup_dir, PathBuf::from("/var/backups/databases"));
        assert_eq!(
            config.metadata_file,
            PathBuf::from("/var/backups/databases/backup-metadata.json")
        );
        assert!(config.database_url.is_none());
        assert!(config.s3.is_none());
        assert_eq!(config.recovery_completion_estimate, Duration::from_secs(300));
        assert_eq!(config.purge_grace_period, Duration::from_secs(86400));
    }

    #[test]
    fn test_metadata_file_follows_backup_dir() {
        let config = Config::from_lookup(lookup_from(&[
            ("BACKUP_DIR", "/srv/dumps"),
            ("DATABASE_URL", "  "),
            ("RECOVERY_COMPLETION_ESTIMATE", "90s"),
        ]))
        .unwrap();
        assert_eq!(
            config.metadata_file,
            PathBuf::from("/srv/dumps/backup-metadata.json")
        );
        assert!(config.database_url.is_none());
        assert_eq!(config.recovery_completion_estimate, Duration::from_secs(90));
    }

    #[test]
    fn test_invalid_duration_is_config_error() {
        let err = Config::from_lookup(lookup_from(&[("PURGE_GRACE_PERIOD", "soon")])).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_s3_secret_is_redacted() {
        let config = Config::from_lookup(lookup_from(&[
            ("S3_BUCKET", "dumps"),
            ("S3_SECRET_ACCESS_KEY", "hunter2"),
        ]))
        .unwrap();
        let s3 = config.s3.expect("s3 settings");
        assert_eq!(s3.region, "us-east-1");
        let debug = format!("{:?}", s3);
        assert!(debug.contains("dumps"));
        assert!(!debug.contains("hunter2"));
    }
}
