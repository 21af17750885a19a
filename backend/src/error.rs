//! Application error types and result alias.

use thiserror::Error;

use crate::models::backup::BackupStatus;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Conflict error (e.g., recovering into a populated store without merge/force)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Rejected status change
    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: BackupStatus,
        to: BackupStatus,
    },

    /// Persisted state could not be parsed
    #[error("Corrupt metadata: {0}")]
    Corruption(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short machine-readable code, used by the CLI's JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Migration(_) => "MIGRATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::InvalidTransition { .. } => "INVALID_TRANSITION",
            AppError::Corruption(_) => "CORRUPTION",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Yaml(_) => "YAML_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The id (or other resource) did not exist; nothing was updated.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    /// The backend could not be reached or written; the caller may retry.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Io(_) | AppError::Storage(_)
        )
    }

    pub(crate) fn record_not_found(id: &str) -> Self {
        AppError::NotFound(format!("backup record {}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct_from_unavailable() {
        let err = AppError::record_not_found("s1-db1-daily-20250101-020000");
        assert!(err.is_not_found());
        assert!(!err.is_unavailable());
        assert_eq!(err.code(), "NOT_FOUND");

        let io = AppError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        assert!(io.is_unavailable());
        assert!(!io.is_not_found());
    }

    #[test]
    fn test_transition_message() {
        let err = AppError::InvalidTransition {
            id: "x".into(),
            from: BackupStatus::Deleted,
            to: BackupStatus::Success,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition for x: deleted -> success"
        );
    }
}
