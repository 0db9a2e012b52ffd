//! store-backup - Incremental and Differential Groupware Store Backups
//!
//! Backs up mailbox stores folder by folder into an on-disk tree of
//! per-folder key-value stores, and restores, merges and purges those trees.
//!
//! # Features
//!
//! - **Incremental Sync**: Each folder keeps the opaque change-feed cursor of
//!   its last run, so only changes since then are fetched.
//!
//! - **Differential Chains**: A differential run writes a new generation next
//!   to the base instead of touching it; generations are merged back in order.
//!
//! - **Tombstones**: Deleted items and folders are kept with their deletion
//!   time until an age-based purge removes them.
//!
//! - **Parallel Stores**: A pool of worker threads backs up one store per
//!   job, with an advisory lock per backup tree.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Groupware Server                            │
//! │            (stores → folders → items, change feeds)             │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               │ StoreProvider / RemoteFolder::sync
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Store Workers                              │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐         ┌─────────┐      │
//! │  │Worker 1 │  │Worker 2 │  │Worker 3 │  ...    │Worker N │      │
//! │  │ store A │  │ store B │  │ store C │         │ store X │      │
//! │  └────┬────┘  └────┬────┘  └────┬────┘         └────┬────┘      │
//! │       │            │            │                    │          │
//! │       ▼            ▼            ▼                    ▼          │
//! │            ┌──────────────────────────┐                         │
//! │            │  Chain planner + lock    │                         │
//! │            │  - base or generation N  │                         │
//! │            └────────────┬─────────────┘                         │
//! │                         ▼                                       │
//! │            ┌──────────────────────────┐                         │
//! │            │  Folder importer         │                         │
//! │            │  - buffered upserts      │                         │
//! │            │  - immediate deletes     │                         │
//! │            └──────────────────────────┘                         │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//!              ┌─────────────────────────────────┐
//!              │  <store>/folders/<sk>/...       │
//!              │    items/  index/  state        │
//!              │  differential/<store>/N/...     │
//!              └─────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Fold every pending generation into the base
//! store-backup merge /srv/backup/alice
//!
//! # Drop anything deleted more than 30 days ago
//! store-backup purge /srv/backup/alice --days 30
//!
//! # Inspect a tree
//! store-backup stats /srv/backup/alice
//! ```

pub mod backup;
pub mod chain;
pub mod config;
pub mod error;
pub mod merge;
pub mod progress;
pub mod purge;
pub mod remote;
pub mod restore;
pub mod state;
pub mod stats;
pub mod sync;
pub mod tree;
pub mod worker;

pub use backup::backup_store;
pub use chain::{list_generations, Chain, GenerationInfo, GenerationStatus};
pub use config::{
    BackupOptions, CliArgs, DeletionPolicy, DuplicatePolicy, RestoreOptions, SchedulerConfig,
};
pub use error::{BackupError, Result};
pub use merge::{merge_generations, run_merge, MergeReport};
pub use purge::run_purge;
pub use restore::run_restore;
pub use stats::{tree_stats, FolderSummary, PurgeStats, Stats};
pub use worker::{run_backup, BackupRun, JobScheduler};
