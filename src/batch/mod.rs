//! Batch uploads.
//!
//! Jobs are queued up front, then `start` runs a fixed pool of workers that
//! drain the queue. Every job takes one permit of the manager's concurrency
//! budget while it runs and reports through its own completion callback, so a
//! failing job never touches the others.

mod job;

pub use job::{BatchJob, BatchJobBuilder, CompletionCallback};

use crate::config::default_thread_pool_size;
use crate::error::{Result, UploadError};
use crate::upload::{run_upload, ResumablePolicy, UploadManager, UploadOptions};
use crate::upload_token::UploadToken;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Outcome counts of one `start` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

pub struct BatchUploader {
    manager: UploadManager,
    token: UploadToken,
    queue: Arc<Mutex<VecDeque<BatchJob>>>,
    thread_pool_size: usize,
    max_concurrency: usize,
    max_queue: Option<usize>,
    resumable_policy: ResumablePolicy,
}

impl std::fmt::Debug for BatchUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchUploader")
            .field("queued", &self.len())
            .field("thread_pool_size", &self.thread_pool_size)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_queue", &self.max_queue)
            .finish()
    }
}

impl BatchUploader {
    pub fn new(manager: UploadManager, token: UploadToken) -> Self {
        let max_concurrency = manager.config().max_concurrency();
        Self {
            manager,
            token,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            thread_pool_size: default_thread_pool_size(),
            max_concurrency,
            max_queue: None,
            resumable_policy: ResumablePolicy::default(),
        }
    }

    /// Number of workers `start` runs, at least 1
    pub fn thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size.max(1);
        self
    }

    /// Block uploads in flight per chunked job, at least 1
    pub fn max_concurrency(mut self, concurrency: usize) -> Self {
        self.max_concurrency = concurrency.max(1);
        self
    }

    /// Bounds the queue; `submit` fails beyond it
    pub fn max_queue(mut self, limit: usize) -> Self {
        self.max_queue = Some(limit);
        self
    }

    /// Default for jobs that do not set their own policy
    pub fn resumable_policy(mut self, policy: ResumablePolicy) -> Self {
        self.resumable_policy = policy;
        self
    }

    /// Capacity hint for the queue
    pub fn set_expected_jobs_count(&self, count: usize) {
        if let Ok(mut queue) = self.queue.lock() {
            let wanted = count.saturating_sub(queue.len());
            queue.reserve(wanted);
        }
    }

    pub fn submit(&self, job: BatchJob) -> Result<()> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| UploadError::Config("Batch queue lock poisoned".to_string()))?;
        if let Some(limit) = self.max_queue {
            if queue.len() >= limit {
                return Err(UploadError::CapacityExceeded { limit });
            }
        }
        queue.push_back(job);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every queued job and resolves once each completion callback fired
    pub async fn start(&self) -> BatchReport {
        let jobs = self.len();
        if jobs == 0 {
            return BatchReport::default();
        }
        let workers = self.thread_pool_size.min(jobs);
        info!(jobs = jobs, workers = workers, "Batch upload started");

        let succeeded = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let state = WorkerState {
                    manager: self.manager.clone(),
                    token: self.token.clone(),
                    queue: Arc::clone(&self.queue),
                    max_concurrency: self.max_concurrency,
                    resumable_policy: self.resumable_policy,
                    succeeded: Arc::clone(&succeeded),
                    failed: Arc::clone(&failed),
                };
                tokio::spawn(state.run(worker))
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Batch worker crashed");
            }
        }

        let report = BatchReport {
            succeeded: succeeded.load(Ordering::SeqCst),
            failed: failed.load(Ordering::SeqCst),
        };
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "Batch upload finished"
        );
        report
    }
}

struct WorkerState {
    manager: UploadManager,
    token: UploadToken,
    queue: Arc<Mutex<VecDeque<BatchJob>>>,
    max_concurrency: usize,
    resumable_policy: ResumablePolicy,
    succeeded: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl WorkerState {
    async fn run(self, worker: usize) {
        while let Some(job) = self.next_job() {
            let BatchJob {
                source,
                params,
                token,
                resumable_policy,
                upload_threshold,
                checksum,
                on_progress,
                on_completed,
            } = job;
            let options = UploadOptions {
                policy: resumable_policy.unwrap_or(self.resumable_policy),
                upload_threshold,
                checksum,
                max_concurrency: self.max_concurrency,
                on_progress,
            };

            let result = match self.manager.acquire_permit().await {
                Ok(_permit) => {
                    run_upload(
                        &self.manager,
                        token.as_ref().unwrap_or(&self.token),
                        &params,
                        &source,
                        options,
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match &result {
                Ok(_) => {
                    self.succeeded.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(
                        worker = worker,
                        key = params.key.as_deref().unwrap_or_default(),
                        error = %e,
                        "Batch job failed"
                    );
                    self.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
            if let Some(callback) = on_completed {
                callback(result);
            }
        }
    }

    fn next_job(&self) -> Option<BatchJob> {
        self.queue.lock().ok().and_then(|mut queue| queue.pop_front())
    }
}
