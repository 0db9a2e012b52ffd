//! Job queue feeding store workers
//!
//! Jobs are loaded once, largest store first, and the sending side is then
//! closed so workers drain the queue and exit on disconnect.

use crate::error::WorkerError;
use crate::stats::Stats;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One store to back up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Store reference handed to the provider
    pub store: String,

    /// Backup tree the store is written to
    pub target: PathBuf,

    /// Size estimate used for ordering
    pub size: u64,
}

impl Job {
    pub fn new(store: impl Into<String>, target: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            store: store.into(),
            target: target.into(),
            size,
        }
    }
}

/// What a worker reports back for one job
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job: Job,

    /// Worker that ran the job
    pub worker: usize,

    /// Store statistics, or the reason the store was abandoned
    pub outcome: std::result::Result<Stats, String>,

    pub duration: Duration,
}

impl JobResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Statistics for the job queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Jobs put on the queue
    pub enqueued: AtomicU64,

    /// Jobs taken by workers
    pub dequeued: AtomicU64,
}

impl QueueStats {
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }
}

/// FIFO of store jobs shared by all workers
pub struct JobQueue {
    sender: Option<Sender<Job>>,
    receiver: Receiver<Job>,
    stats: Arc<QueueStats>,
}

impl JobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender: Some(sender),
            receiver,
            stats: Arc::new(QueueStats::default()),
        }
    }

    /// Enqueue `jobs` largest first, then close the queue
    ///
    /// Returns the number of jobs enqueued.
    pub fn load(&mut self, mut jobs: Vec<Job>) -> Result<usize, WorkerError> {
        jobs.sort_by(|a, b| b.size.cmp(&a.size));
        let sender = self.sender.take().ok_or(WorkerError::QueueSendFailed)?;
        let count = jobs.len();
        for job in jobs {
            sender.send(job).map_err(|_| WorkerError::QueueSendFailed)?;
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        Ok(count)
    }

    /// Handle for a worker
    pub fn receiver(&self) -> JobReceiver {
        JobReceiver {
            receiver: self.receiver.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker side of the queue
#[derive(Clone)]
pub struct JobReceiver {
    receiver: Receiver<Job>,
    stats: Arc<QueueStats>,
}

impl JobReceiver {
    /// Block for the next job; `None` once the queue is closed and drained
    pub fn recv(&self) -> Option<Job> {
        let job = self.receiver.recv().ok()?;
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(job)
    }
}
