//! Configuration types for store-backup
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Validated runtime options for backup, restore and the worker pool
//! - Date argument parsing

use crate::error::ConfigError;
use crate::remote::TimeWindow;
use crate::state::{DEFAULT_FLUSH_THRESHOLD, MIN_FLUSH_THRESHOLD};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use std::path::PathBuf;

/// Maximum reasonable worker count
pub const MAX_WORKERS: usize = 512;

/// Backup tree maintenance for groupware stores
#[derive(Parser, Debug, Clone)]
#[command(
    name = "store-backup",
    version,
    about = "Maintain incremental and differential groupware store backups",
    long_about = "Operates on backup trees written by the store-backup engine.\n\n\
                  Differential generations can be folded back into their base tree,\n\
                  tombstoned folders and items can be purged by age, and trees can be\n\
                  inspected without touching them.",
    after_help = "EXAMPLES:\n    \
        store-backup merge /srv/backup/alice\n    \
        store-backup merge /srv/backup/alice --generations 1,2\n    \
        store-backup purge /srv/backup/alice --days 30\n    \
        store-backup stats /srv/backup/alice\n    \
        store-backup generations /srv/backup/alice"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Merge differential generations into their base tree
    Merge {
        /// Base backup tree
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Generations to merge (default: every unmerged one)
        #[arg(long, value_name = "N,..", value_delimiter = ',')]
        generations: Vec<u32>,
    },

    /// Remove folders and items deleted longer ago than a threshold
    Purge {
        /// Backup tree
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Age threshold in days
        #[arg(long, value_name = "DAYS")]
        days: u32,

        /// Reference time instead of now (YYYY-MM-DD or RFC 3339)
        #[arg(long, value_name = "DATE")]
        as_of: Option<String>,
    },

    /// Show per-folder statistics of a backup tree
    Stats {
        /// Backup tree
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Only show folders whose path contains this text
        #[arg(long, value_name = "TEXT")]
        filter: Option<String>,
    },

    /// List the differential generations of a base tree
    Generations {
        /// Base backup tree
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

fn default_workers() -> usize {
    // Store jobs are dominated by server round-trips
    num_cpus::get()
}

/// Parse a date argument: `YYYY-MM-DD` (midnight UTC) or RFC 3339
pub fn parse_date(value: &str) -> Result<DateTime<Utc>, ConfigError> {
    let value = value.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Ok(time.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ConfigError::InvalidDate {
            value: value.to_string(),
        })
}

fn validate_window(window: Option<&TimeWindow>) -> Result<(), ConfigError> {
    if let Some(TimeWindow {
        begin: Some(begin),
        end: Some(end),
    }) = window
    {
        if begin >= end {
            return Err(ConfigError::InvalidWindow {
                begin: begin.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
    }
    Ok(())
}

/// Options for backing up one store
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Write a new differential generation instead of updating the base
    pub differential: bool,

    /// Only back up these folder paths (empty = whole store)
    pub folders: Vec<String>,

    /// Include subfolders of `folders`
    pub recursive: bool,

    /// Only materialize changes inside this window
    pub window: Option<TimeWindow>,

    /// Buffered payload size that triggers a flush
    pub flush_threshold: usize,

    /// Serialize items with their attachments
    pub with_attachments: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            differential: false,
            folders: Vec::new(),
            recursive: true,
            window: None,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            with_attachments: true,
        }
    }
}

impl BackupOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_threshold < MIN_FLUSH_THRESHOLD {
            return Err(ConfigError::InvalidFlushThreshold {
                size: self.flush_threshold,
                min: MIN_FLUSH_THRESHOLD,
            });
        }
        validate_window(self.window.as_ref())
    }

    /// True when only part of the hierarchy is backed up
    pub fn is_folder_scoped(&self) -> bool {
        !self.folders.is_empty()
    }
}

/// What restore does with tombstoned records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Leave deleted items out
    #[default]
    Omit,
    /// Replay deletions against the target
    Include,
}

/// What restore does when the target already holds an item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    #[default]
    Skip,
    /// Delete the existing item and restore again
    Overwrite,
}

/// Options for restoring a backup tree
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Only restore these folder paths (empty = whole tree)
    pub folders: Vec<String>,

    /// Include subfolders of `folders`
    pub recursive: bool,

    /// Only restore these item sourcekeys
    pub sourcekeys: Vec<String>,

    /// Only restore items last modified inside this window
    pub window: Option<TimeWindow>,

    pub deletes: DeletionPolicy,

    pub duplicates: DuplicatePolicy,

    /// Restore under this folder instead of the store root
    pub restore_root: Option<String>,

    /// Also apply unmerged differential generations, oldest first
    pub differential: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            folders: Vec::new(),
            recursive: true,
            sourcekeys: Vec::new(),
            window: None,
            deletes: DeletionPolicy::Omit,
            duplicates: DuplicatePolicy::Skip,
            restore_root: None,
            differential: false,
        }
    }
}

impl RestoreOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sourcekeys.is_empty() && self.folders.is_empty() {
            return Err(ConfigError::Conflict(
                "restoring sourcekeys requires a folder selection".into(),
            ));
        }
        if let Some(root) = &self.restore_root {
            if root.trim_matches('/').is_empty() {
                return Err(ConfigError::Conflict("restore root must not be empty".into()));
            }
        }
        validate_window(self.window.as_ref())
    }

    /// Store-level settings are only restored by a full restore
    pub fn restores_store_metadata(&self) -> bool {
        self.folders.is_empty() && self.sourcekeys.is_empty() && self.restore_root.is_none()
    }

    /// Logical target path for a backed-up folder path
    pub fn target_path(&self, path: &str) -> String {
        match &self.restore_root {
            Some(root) => format!("{}/{}", root.trim_matches('/'), path),
            None => path.to_string(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of store workers
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(workers: usize) -> Result<Self, ConfigError> {
        let config = Self { workers };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count: self.workers,
                max: MAX_WORKERS,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2024-02-29").unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_date("2024-02-29T10:00:00+02:00").unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 29, 8, 0, 0).unwrap()
        );
        assert!(parse_date("29/02/2024").is_err());
    }

    #[test]
    fn test_worker_count_bounds() {
        assert!(SchedulerConfig::new(1).is_ok());
        assert!(SchedulerConfig::new(MAX_WORKERS).is_ok());
        assert!(matches!(
            SchedulerConfig::new(0),
            Err(ConfigError::InvalidWorkerCount { .. })
        ));
        assert!(SchedulerConfig::new(MAX_WORKERS + 1).is_err());
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_backup_options_validation() {
        assert!(BackupOptions::default().validate().is_ok());

        let tiny = BackupOptions {
            flush_threshold: 16,
            ..Default::default()
        };
        assert!(matches!(
            tiny.validate(),
            Err(ConfigError::InvalidFlushThreshold { .. })
        ));

        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let inverted = BackupOptions {
            window: Some(TimeWindow::new(Some(t), Some(t))),
            ..Default::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn test_restore_options() {
        let options = RestoreOptions {
            restore_root: Some("/Restored/".into()),
            ..Default::default()
        };
        assert!(options.validate().is_ok());
        assert_eq!(options.target_path("Inbox/Work"), "Restored/Inbox/Work");
        assert!(!options.restores_store_metadata());
        assert!(RestoreOptions::default().restores_store_metadata());

        let keys_only = RestoreOptions {
            sourcekeys: vec!["AA".into()],
            ..Default::default()
        };
        assert!(matches!(
            keys_only.validate(),
            Err(ConfigError::Conflict(_))
        ));
    }

    #[test]
    fn test_cli_parse() {
        let args = CliArgs::parse_from([
            "store-backup",
            "merge",
            "/srv/backup/alice",
            "--generations",
            "1,2",
        ]);
        match args.command {
            Command::Merge { path, generations } => {
                assert_eq!(path, PathBuf::from("/srv/backup/alice"));
                assert_eq!(generations, vec![1, 2]);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args = CliArgs::parse_from(["store-backup", "purge", "/b", "--days", "30", "-v"]);
        assert!(args.verbose);
        assert!(matches!(args.command, Command::Purge { days: 30, .. }));
    }
}
