//! Error types for store-backup
//!
//! This module defines the error hierarchy for the backup engine:
//! - Folder state (RocksDB) errors
//! - Remote store errors, split into item-level and transport failures
//! - Differential chain errors
//! - Configuration and worker errors
//!
//! Item-level failures are recovered where they happen and only counted.
//! Transport failures abandon the current folder. Structural failures
//! (bad paths, lock contention, broken chains) abort the operation.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the backup engine
#[derive(Error, Debug)]
pub enum BackupError {
    /// Folder state store errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Remote store errors
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Differential chain errors
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// I/O errors (flat files, directory walks)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another operation holds the tree lock
    #[error("Backup tree '{path}' is locked by another operation")]
    Locked { path: PathBuf },

    /// The backup tree is missing or malformed
    #[error("Invalid backup tree '{path}': {reason}")]
    InvalidTree { path: PathBuf, reason: String },
}

/// Per-folder key-value store errors
#[derive(Error, Debug)]
pub enum StateError {
    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    Rocks(#[from] rocksdb::Error),

    /// Bincode serialization/deserialization error
    #[error("Serialization error: {0}")]
    Bincode(String),

    /// zstd compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Key was not valid ASCII/UTF-8
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Write attempted on a folder opened for reading
    #[error("Folder state '{0}' is opened read-only")]
    ReadOnly(PathBuf),
}

/// Errors reported by the remote groupware store
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    /// The change feed or connection failed mid-operation
    #[error("Transport failure on '{context}': {reason}")]
    Transport { context: String, reason: String },

    /// An item could not be serialized
    #[error("Failed to serialize item {sourcekey}: {reason}")]
    Serialize { sourcekey: String, reason: String },

    /// A stored payload could not be turned back into an item
    #[error("Invalid item payload: {0}")]
    InvalidPayload(String),

    /// An item could not be created or removed in the target
    #[error("Item operation failed on '{folder}': {reason}")]
    ItemFailed { folder: String, reason: String },

    /// Store, folder or item does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    /// Check if this error only affects a single item
    pub fn is_item_level(&self) -> bool {
        matches!(
            self,
            RemoteError::Serialize { .. }
                | RemoteError::InvalidPayload(_)
                | RemoteError::ItemFailed { .. }
        )
    }
}

/// Differential chain errors
#[derive(Error, Debug)]
pub enum ChainError {
    /// Generation directory lacks its metadata file
    #[error("Generation {generation} has no chain metadata")]
    MissingMetadata { generation: u32 },

    /// Generation metadata could not be parsed
    #[error("Generation {generation} metadata is invalid: {reason}")]
    InvalidMetadata { generation: u32, reason: String },

    /// Generation requested that does not exist on disk
    #[error("Generation {generation} does not exist")]
    NoSuchGeneration { generation: u32 },

    /// Generations supplied out of order, or with a gap
    #[error("Generation {found} cannot be merged next: expected generation {expected}")]
    OutOfOrder { expected: u32, found: u32 },

    /// Generation was built from a different predecessor
    #[error("Generation {generation} was built from {recorded}, but the chain is at {actual}")]
    BrokenLink {
        generation: u32,
        recorded: String,
        actual: String,
    },
}

/// Configuration and option errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid flush threshold
    #[error("Invalid flush threshold {size}: must be at least {min} bytes")]
    InvalidFlushThreshold { size: usize, min: usize },

    /// Time window with begin not before end
    #[error("Invalid time window: begin {begin} is not before end {end}")]
    InvalidWindow { begin: String, end: String },

    /// Mutually exclusive options
    #[error("Conflicting options: {0}")]
    Conflict(String),

    /// Backup path error
    #[error("Invalid backup path '{path}': {reason}")]
    InvalidBackupPath { path: PathBuf, reason: String },

    /// Unparseable date argument
    #[error("Invalid date '{value}': expected YYYY-MM-DD or RFC 3339")]
    InvalidDate { value: String },
}

/// Worker thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker panicked
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },

    /// Job queue send failed
    #[error("Failed to send job: queue closed")]
    QueueSendFailed,

    /// Result channel closed before every job reported
    #[error("Result channel closed with {missing} job(s) unreported")]
    ResultChannelClosed { missing: usize },

    /// Worker initialization failed
    #[error("Failed to initialize worker {id}: {reason}")]
    InitFailed { id: usize, reason: String },
}

/// Result type alias for BackupError
pub type Result<T> = std::result::Result<T, BackupError>;

/// Result type alias for StateError
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Result type alias for RemoteError
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Represents the outcome of backing up a single folder
#[derive(Debug)]
pub enum FolderOutcome {
    /// Folder synced; `changes` counts materialized upserts and read changes
    Synced {
        path: String,
        changes: u64,
        deletes: u64,
    },

    /// Folder left out of this run
    Skipped { path: String, reason: String },

    /// Folder sync abandoned; its cursor stays at the last flushed value
    Failed { path: String, error: BackupError },
}

impl FolderOutcome {
    /// Returns true if this outcome represents success
    pub fn is_success(&self) -> bool {
        matches!(self, FolderOutcome::Synced { .. })
    }

    /// Returns the folder path associated with this outcome
    pub fn path(&self) -> &str {
        match self {
            FolderOutcome::Synced { path, .. } => path,
            FolderOutcome::Skipped { path, .. } => path,
            FolderOutcome::Failed { path, .. } => path,
        }
    }
}
