//! Scheduler - fans store jobs out to the worker pool
//!
//! The scheduler is responsible for:
//! - Validating the job list and sizing the jobs
//! - Spawning at most one worker per job
//! - Collecting exactly one result per job
//! - Aggregating statistics across stores

use crate::config::{BackupOptions, SchedulerConfig};
use crate::error::{ConfigError, Result, WorkerError};
use crate::remote::StoreProvider;
use crate::stats::Stats;
use crate::worker::queue::{Job, JobQueue, JobResult};
use crate::worker::worker::Worker;
use crossbeam_channel::unbounded;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Result of a completed multi-store run
#[derive(Debug, Clone, Default)]
pub struct BackupRun {
    /// Sum over every store that completed
    pub stats: Stats,

    /// Per-job outcome, in completion order
    pub jobs: Vec<JobResult>,

    /// Stores that were abandoned
    pub failed: usize,

    pub duration: Duration,
}

impl BackupRun {
    pub fn succeeded(&self) -> usize {
        self.jobs.len() - self.failed
    }
}

/// Runs store backups on a fixed pool of worker threads
pub struct JobScheduler<P> {
    provider: Arc<P>,
    options: Arc<BackupOptions>,
    workers: usize,
}

impl<P: StoreProvider + 'static> JobScheduler<P> {
    pub fn new(provider: Arc<P>, options: BackupOptions, config: &SchedulerConfig) -> Result<Self> {
        config.validate()?;
        options.validate()?;
        Ok(Self {
            provider,
            options: Arc::new(options),
            workers: config.workers,
        })
    }

    /// Back up every `(store, target)` pair
    ///
    /// Blocks until each job has reported. A failed store is counted and
    /// reported; it never aborts the other jobs.
    pub fn run(&self, jobs: Vec<(String, PathBuf)>) -> Result<BackupRun> {
        let start = Instant::now();
        validate_targets(&jobs)?;

        let jobs: Vec<Job> = jobs
            .into_iter()
            .map(|(store, target)| {
                let size = self.provider.store_size(&store);
                Job::new(store, target, size)
            })
            .collect();

        let mut queue = JobQueue::new();
        let expected = queue.load(jobs)?;
        if expected == 0 {
            return Ok(BackupRun::default());
        }

        let worker_count = self.workers.min(expected);
        info!(jobs = expected, workers = worker_count, "Starting store backups");

        let (result_tx, result_rx) = unbounded();
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            workers.push(Worker::spawn(
                id,
                Arc::clone(&self.provider),
                Arc::clone(&self.options),
                queue.receiver(),
                result_tx.clone(),
            )?);
        }
        // Only workers hold senders now
        drop(result_tx);

        let mut run = BackupRun::default();
        while run.jobs.len() < expected {
            let Ok(result) = result_rx.recv() else {
                break;
            };
            match &result.outcome {
                Ok(stats) => run.stats += *stats,
                Err(_) => {
                    run.failed += 1;
                    run.stats.errors += 1;
                }
            }
            run.jobs.push(result);
        }

        for worker in workers {
            let id = worker.id();
            if let Err(e) = worker.join() {
                warn!(worker = id, error = %e, "Worker failed to join cleanly");
            }
        }

        if run.jobs.len() < expected {
            return Err(WorkerError::ResultChannelClosed {
                missing: expected - run.jobs.len(),
            }
            .into());
        }

        run.duration = start.elapsed();
        info!(
            stores = expected,
            failed = run.failed,
            changes = run.stats.changes,
            deletes = run.stats.deletes,
            errors = run.stats.errors,
            duration_secs = run.duration.as_secs(),
            "Store backups completed"
        );
        Ok(run)
    }
}

/// Back up many stores in parallel
pub fn run_backup<P: StoreProvider + 'static>(
    provider: Arc<P>,
    jobs: Vec<(String, PathBuf)>,
    options: BackupOptions,
    config: &SchedulerConfig,
) -> Result<BackupRun> {
    JobScheduler::new(provider, options, config)?.run(jobs)
}

fn validate_targets(jobs: &[(String, PathBuf)]) -> std::result::Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for (_, target) in jobs {
        let parent = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if !parent.is_dir() {
            return Err(ConfigError::InvalidBackupPath {
                path: target.clone(),
                reason: format!("parent directory '{}' does not exist", parent.display()),
            });
        }
        if !seen.insert(target.as_path()) {
            return Err(ConfigError::InvalidBackupPath {
                path: target.clone(),
                reason: "target used by more than one job".into(),
            });
        }
    }
    Ok(())
}
