//! Command-line interface definition.
//!
//! Maintenance commands for backup metadata: recovery from artifacts,
//! backend migration, listing, statistics and retention enforcement.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::backup::{BackupStatus, BackupType};

/// Backup metadata maintenance
#[derive(Parser, Debug)]
#[command(name = "dump-keeper", version)]
#[command(about = "Inspect and repair database backup metadata", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output format (text, json)
    #[arg(long, default_value = "text", value_parser = ["text", "json"], global = true)]
    pub format: String,

    /// Relational store URL; the JSON file store is used when unset
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Root of the local backup tree
    #[arg(long, env = "BACKUP_DIR", global = true)]
    pub backup_dir: Option<PathBuf>,

    /// JSON metadata file (defaults to <backup-dir>/backup-metadata.json)
    #[arg(long, env = "METADATA_FILE", global = true)]
    pub metadata_file: Option<PathBuf>,

    /// YAML retention rules
    #[arg(long, env = "RETENTION_CONFIG", global = true)]
    pub retention_config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL", global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Rebuild metadata from backup files on disk and in the bucket
    Recover {
        /// Show what would be recovered without writing
        #[arg(long)]
        dry_run: bool,

        /// Log every skipped file
        #[arg(short, long)]
        verbose: bool,

        /// Do not scan the local backup directory
        #[arg(long)]
        no_local: bool,

        /// Do not scan the S3 bucket
        #[arg(long)]
        no_remote: bool,

        /// Recover even when the store already has records
        #[arg(long)]
        force: bool,

        /// Skip artifacts that already have a record
        #[arg(long)]
        merge: bool,
    },

    /// Copy records from the JSON file into the relational store
    Migrate,

    /// List backup records
    List {
        /// Filter by server name
        #[arg(long)]
        server: Option<String>,

        /// Filter by database name
        #[arg(long)]
        database: Option<String>,

        /// Filter by backup type
        #[arg(long = "type")]
        backup_type: Option<BackupType>,

        /// Filter by status
        #[arg(long)]
        status: Option<BackupStatus>,

        /// Hide deleted records
        #[arg(long)]
        active_only: bool,

        /// Oldest records first
        #[arg(long)]
        oldest_first: bool,

        /// Number of records to show
        #[arg(short, long, default_value = "50")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Show one backup record
    Show {
        /// Record id
        id: String,
    },

    /// Show aggregate statistics
    Stats,

    /// Expire records past their retention and purge old deleted ones
    Expire {
        /// Keep deleted records this long before purging (e.g. 24h)
        #[arg(long, value_parser = humantime::parse_duration)]
        grace: Option<Duration>,
    },
}

/// Print message based on output format
pub fn output(format: &str, message: &str, json_value: Option<serde_json::Value>) {
    match format {
        "json" => {
            let value = json_value.unwrap_or_else(|| serde_json::json!({ "message": message }));
            println!(
                "{}",
                serde_json::to_string_pretty(&value).unwrap_or_default()
            );
        }
        _ => {
            println!("{}", message);
        }
    }
}

/// Print error message
pub fn error(format: &str, code: &str, message: &str) {
    match format {
        "json" => {
            eprintln!(
                "{}",
                serde_json::json!({ "error": message, "code": code })
            );
        }
        _ => {
            eprintln!("Error: {}", message);
        }
    }
}

/// Print table row
pub fn table_row(cells: &[&str]) {
    println!("{}", cells.join("\t"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_recover_flags() {
        let cli = Cli::try_parse_from([
            "dump-keeper",
            "recover",
            "--dry-run",
            "--merge",
            "--no-remote",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.format, "json");
        match cli.command {
            Command::Recover {
                dry_run,
                merge,
                no_remote,
                force,
                ..
            } => {
                assert!(dry_run && merge && no_remote);
                assert!(!force);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_list_filters() {
        let cli = Cli::try_parse_from([
            "dump-keeper",
            "list",
            "--type",
            "daily",
            "--status",
            "success",
            "--limit",
            "5",
        ])
        .unwrap();
        match cli.command {
            Command::List {
                backup_type,
                status,
                limit,
                ..
            } => {
                assert_eq!(backup_type, Some(BackupType::Daily));
                assert_eq!(status, Some(BackupStatus::Success));
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_expire_grace() {
        let cli = Cli::try_parse_from(["dump-keeper", "expire", "--grace", "2h"]).unwrap();
        match cli.command {
            Command::Expire { grace } => assert_eq!(grace, Some(Duration::from_secs(7200))),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["dump-keeper", "stats", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_output_json() {
        // Just test that it doesn't panic
        output("json", "test message", Some(serde_json::json!({"key": "value"})));
        output("json", "test message", None);
    }
}
