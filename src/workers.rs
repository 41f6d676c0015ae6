//! Workers applying queued jobs to the post store.
//!
//! Each worker thread loops claim → handle → complete/fail on one queue.
//! Handlers are idempotent, so a job redelivered after a crash or an expired
//! lease does no harm when applied twice.

use crate::classifier::FeedRegistry;
use crate::clock::Clock;
use crate::error::{FeedError, Result};
use crate::queue::{DurableQueue, FailureKind, JobPayload, CREATES_QUEUE, DELETES_QUEUE};
use crate::shutdown::Shutdown;
use crate::store::{InsertOutcome, PostStore};
use crate::types::{CreateJob, DeleteJob};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Worker pool sizing and polling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub creates_concurrency: usize,
    pub deletes_concurrency: usize,

    /// Longest a worker waits on an empty queue before re-checking shutdown.
    /// Default: 250ms
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            creates_concurrency: 2,
            deletes_concurrency: 1,
            poll_interval_ms: 250,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Applies one job's effect.
pub trait JobHandler<J>: Send + Sync {
    fn handle(&self, job: &J) -> Result<()>;
}

/// Persists accepted posts.
pub struct CreatesHandler {
    registry: FeedRegistry,
    store: Arc<dyn PostStore>,
    clock: Arc<dyn Clock>,
}

impl CreatesHandler {
    pub fn new(registry: FeedRegistry, store: Arc<dyn PostStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            store,
            clock,
        }
    }
}

impl JobHandler<CreateJob> for CreatesHandler {
    fn handle(&self, job: &CreateJob) -> Result<()> {
        let policy = self
            .registry
            .get(&job.feed)
            .ok_or_else(|| FeedError::UnsupportedFeed(job.feed.clone()))?;

        if !policy.accept_text(&job.text) {
            tracing::debug!(uri = %job.uri, feed = %job.feed, "job no longer matches, skipping");
            return Ok(());
        }

        let outcome = self
            .store
            .insert_post(job.clone().into_post(self.clock.now()))?;
        if outcome == InsertOutcome::AlreadyPresent {
            tracing::debug!(uri = %job.uri, feed = %job.feed, "post already indexed");
        }
        Ok(())
    }
}

/// Removes deleted posts from every feed.
pub struct DeletesHandler {
    store: Arc<dyn PostStore>,
}

impl DeletesHandler {
    pub fn new(store: Arc<dyn PostStore>) -> Self {
        Self { store }
    }
}

impl JobHandler<DeleteJob> for DeletesHandler {
    fn handle(&self, job: &DeleteJob) -> Result<()> {
        let removed = self.store.delete_post(&job.uri)?;
        if removed > 0 {
            tracing::debug!(uri = %job.uri, removed, "deleted post");
        }
        Ok(())
    }
}

/// Claim and run at most one job, waiting up to `wait` for one.
///
/// Returns whether a job was claimed. Handler errors are reported to the
/// queue, retryable or permanent per [`FeedError::is_retryable`]; a handler
/// panic is a retryable failure. Only queue errors surface here.
pub fn process_one<J: JobPayload>(
    queue: &DurableQueue<J>,
    handler: &dyn JobHandler<J>,
    wait: Duration,
) -> Result<bool> {
    let Some(claimed) = queue.claim_timeout(wait)? else {
        return Ok(false);
    };

    let handled = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&claimed.payload)));
    let result = match handled {
        Ok(Ok(())) => queue.complete(&claimed),
        Ok(Err(e)) => {
            let kind = if e.is_retryable() {
                FailureKind::Retryable
            } else {
                FailureKind::Permanent
            };
            queue.fail(&claimed, kind, &e.to_string()).map(|_| ())
        }
        Err(payload) => {
            let reason = panic_reason(payload.as_ref());
            tracing::error!(
                queue = queue.name(),
                job_id = %claimed.id,
                attempt = claimed.attempt,
                reason = %reason,
                "job handler panicked"
            );
            let message = format!("handler panicked: {reason}");
            queue
                .fail(&claimed, FailureKind::Retryable, &message)
                .map(|_| ())
        }
    };

    match result {
        Err(FeedError::StaleLease { queue, job_id }) => {
            tracing::warn!(
                queue = %queue,
                job_id = %job_id,
                attempt = claimed.attempt,
                "lease expired while the job ran, result dropped"
            );
            Ok(true)
        }
        other => other.map(|()| true),
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Threads draining the creates and deletes queues.
pub struct WorkerPool {
    shutdown: Shutdown,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the configured number of workers per queue.
    pub fn start(
        config: &WorkerConfig,
        creates: Arc<DurableQueue<CreateJob>>,
        creates_handler: Arc<dyn JobHandler<CreateJob>>,
        deletes: Arc<DurableQueue<DeleteJob>>,
        deletes_handler: Arc<dyn JobHandler<DeleteJob>>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let mut pool = Self {
            shutdown,
            handles: Vec::new(),
        };

        pool.spawn_workers(
            CREATES_QUEUE,
            config.creates_concurrency,
            config.poll_interval(),
            creates,
            creates_handler,
        )?;
        pool.spawn_workers(
            DELETES_QUEUE,
            config.deletes_concurrency,
            config.poll_interval(),
            deletes,
            deletes_handler,
        )?;

        tracing::info!(
            creates = config.creates_concurrency,
            deletes = config.deletes_concurrency,
            "started workers"
        );
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop claiming, let in-flight jobs finish, and join every worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn spawn_workers<J: JobPayload>(
        &mut self,
        name: &str,
        count: usize,
        poll: Duration,
        queue: Arc<DurableQueue<J>>,
        handler: Arc<dyn JobHandler<J>>,
    ) -> Result<()> {
        for i in 0..count {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let shutdown = self.shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || run_worker(&queue, handler.as_ref(), &shutdown, poll))?;
            self.handles.push(handle);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.shutdown.trigger();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<J: JobPayload>(
    queue: &DurableQueue<J>,
    handler: &dyn JobHandler<J>,
    shutdown: &Shutdown,
    poll: Duration,
) {
    tracing::debug!(queue = queue.name(), "worker started");
    while !shutdown.is_triggered() {
        if let Err(e) = process_one(queue, handler, poll) {
            tracing::error!(queue = queue.name(), error = %e, "worker failed to process job");
            shutdown.wait_timeout(poll);
        }
    }
    tracing::debug!(queue = queue.name(), "worker stopped");
}
