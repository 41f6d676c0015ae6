//! Durable job queues decoupling ingestion from persistence.
//!
//! Two queues are used: `creates` carries accepted posts, `deletes` carries
//! every post deletion seen on the stream. Each provides:
//! - At-least-once delivery under exclusive, time-bounded leases
//! - Retries with exponential backoff and a bounded attempt budget
//! - Retention of completed (1h / 1000 jobs) and failed (24h) jobs
//!
//! # Example
//!
//! ```ignore
//! let queue: DurableQueue<DeleteJob> =
//!     DurableQueue::open("./data/queues", DELETES_QUEUE, QueueConfig::default(), clock)?;
//!
//! queue.enqueue(DeleteJob { uri })?;
//!
//! if let Some(job) = queue.claim_timeout(Duration::from_millis(500))? {
//!     match handle(&job.payload) {
//!         Ok(()) => queue.complete(&job)?,
//!         Err(e) => { queue.fail(&job, FailureKind::Retryable, &e.to_string())?; }
//!     }
//! }
//! ```

mod durable;
mod types;

use crate::error::Result;
use crate::types::JobId;

pub use durable::DurableQueue;
pub use types::{
    ClaimedJob, FailureDisposition, FailureKind, JobFailure, JobPayload, JobRecord, JobState,
    QueueConfig, QueueCounts, CREATES_QUEUE, DELETES_QUEUE,
};

/// Anything jobs can be handed to. The router enqueues through this.
pub trait JobSink<J>: Send + Sync {
    fn enqueue(&self, job: J) -> Result<JobId>;
}

impl<J: JobPayload> JobSink<J> for DurableQueue<J> {
    fn enqueue(&self, job: J) -> Result<JobId> {
        DurableQueue::enqueue(self, job)
    }
}
