//! Store worker threads
//!
//! Each worker:
//! - Pulls one store job at a time from the job queue
//! - Opens its own connection to the store through the provider
//! - Runs the whole store backup before taking the next job
//! - Sends exactly one [`JobResult`] per job, panics included

use crate::backup::backup_store;
use crate::config::BackupOptions;
use crate::error::WorkerError;
use crate::remote::StoreProvider;
use crate::stats::Stats;
use crate::worker::queue::{Job, JobReceiver, JobResult};
use chrono::Utc;
use crossbeam_channel::Sender;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// A worker thread that backs up stores
pub struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a new worker thread
    pub fn spawn<P>(
        id: usize,
        provider: Arc<P>,
        options: Arc<BackupOptions>,
        jobs: JobReceiver,
        results: Sender<JobResult>,
    ) -> Result<Self, WorkerError>
    where
        P: StoreProvider + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("store-worker-{}", id))
            .spawn(move || worker_loop(id, provider, options, jobs, results))
            .map_err(|e| WorkerError::InitFailed {
                id,
                reason: e.to_string(),
            })?;

        Ok(Self {
            id,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), WorkerError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|payload| WorkerError::Panicked {
                id: self.id,
                message: panic_message(payload.as_ref()),
            }),
            None => Ok(()),
        }
    }
}

fn worker_loop<P: StoreProvider>(
    id: usize,
    provider: Arc<P>,
    options: Arc<BackupOptions>,
    jobs: JobReceiver,
    results: Sender<JobResult>,
) {
    debug!(worker = id, "Worker starting");

    while let Some(job) = jobs.recv() {
        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            process_job(provider.as_ref(), &job, &options)
        }))
        .unwrap_or_else(|payload| Err(format!("panic: {}", panic_message(payload.as_ref()))));

        match &outcome {
            Ok(stats) => info!(
                worker = id,
                store = %job.store,
                changes = stats.changes,
                deletes = stats.deletes,
                errors = stats.errors,
                "Store finished"
            ),
            Err(reason) => warn!(worker = id, store = %job.store, error = %reason, "Store failed"),
        }

        let result = JobResult {
            job,
            worker: id,
            outcome,
            duration: start.elapsed(),
        };
        if results.send(result).is_err() {
            warn!(worker = id, "Result channel closed; stopping");
            break;
        }
    }

    debug!(worker = id, "Worker exiting");
}

fn process_job<P: StoreProvider>(
    provider: &P,
    job: &Job,
    options: &BackupOptions,
) -> std::result::Result<Stats, String> {
    let store = provider.open(&job.store).map_err(|e| e.to_string())?;
    backup_store(&store, &job.target, options, Utc::now()).map_err(|e| e.to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker thread panicked".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryServer;
    use crate::worker::queue::JobQueue;
    use chrono::TimeZone;
    use crossbeam_channel::unbounded;
    use tempfile::tempdir;

    #[test]
    fn test_worker_reports_each_job() {
        let dir = tempdir().unwrap();
        let server = MemoryServer::new();
        let store = server.add_store("alice");
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.add_item("Inbox", "hello", b"hi", when).unwrap();

        let mut queue = JobQueue::new();
        queue
            .load(vec![
                Job::new("alice", dir.path().join("alice"), 2),
                Job::new("nobody", dir.path().join("nobody"), 1),
            ])
            .unwrap();

        let (tx, rx) = unbounded();
        let worker = Worker::spawn(
            7,
            Arc::new(server),
            Arc::new(BackupOptions::default()),
            queue.receiver(),
            tx,
        )
        .unwrap();
        worker.join().unwrap();

        let results: Vec<JobResult> = rx.try_iter().collect();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.worker == 7));

        let alice = results.iter().find(|r| r.job.store == "alice").unwrap();
        assert_eq!(alice.outcome.as_ref().unwrap().changes, 1);

        let nobody = results.iter().find(|r| r.job.store == "nobody").unwrap();
        assert!(nobody.outcome.as_ref().unwrap_err().contains("nobody"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(payload.as_ref()), "worker thread panicked");
    }
}
