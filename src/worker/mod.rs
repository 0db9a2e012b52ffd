//! Worker pool running one store backup per job
//!
//! The coordinator loads every job onto a shared queue (largest store
//! first), spawns a fixed number of worker threads and waits for one
//! result per job. Workers share nothing but the queue, the result channel
//! and the store provider; per-store exclusion comes from the tree lock
//! taken inside [`crate::backup::backup_store`].

pub mod coordinator;
pub mod queue;
pub mod worker;

pub use coordinator::{run_backup, BackupRun, JobScheduler};
pub use queue::{Job, JobQueue, JobResult};
pub use worker::Worker;
