//! Queue configuration, job records, and observability types.

use crate::error::FeedError;
use crate::types::{JobId, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Name of the queue carrying accepted creates.
pub const CREATES_QUEUE: &str = "creates";

/// Name of the queue carrying deletes.
pub const DELETES_QUEUE: &str = "deletes";

/// Bounds required of a job payload.
pub trait JobPayload: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> JobPayload for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Retry, lease, and retention settings for a queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Total deliveries before a job is failed permanently.
    /// Default: 3
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on every further attempt.
    /// Default: 1s
    pub backoff_base_ms: u64,

    /// Ceiling for the retry delay.
    /// Default: 60s
    pub backoff_max_ms: u64,

    /// How long a claimed job stays invisible to other workers.
    /// Default: 30s
    pub lease_ms: u64,

    /// Completed jobs older than this are purged.
    /// Default: 1 hour
    pub completed_max_age_ms: u64,

    /// At most this many completed jobs are kept.
    /// Default: 1000
    pub completed_max_count: usize,

    /// Failed jobs older than this are purged.
    /// Default: 24 hours
    pub failed_max_age_ms: u64,

    /// fsync the journal on every write.
    pub fsync: bool,

    /// Rewrite the journal after this many purged jobs.
    pub compact_after: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            lease_ms: 30_000,
            completed_max_age_ms: 3_600 * 1_000,
            completed_max_count: 1_000,
            failed_max_age_ms: 24 * 3_600 * 1_000,
            fsync: true,
            compact_after: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn completed_max_age(&self) -> Duration {
        Duration::from_millis(self.completed_max_age_ms)
    }

    pub fn failed_max_age(&self) -> Duration {
        Duration::from_millis(self.failed_max_age_ms)
    }

    /// Delay before retrying after the given (1-based) attempt failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Lifecycle state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Waiting for its retry time.
    Delayed,
    /// Claimed by a worker under a lease.
    Active,
    /// Finished successfully; kept until retention purges it.
    Completed,
    /// Out of retries; kept for inspection until retention purges it.
    Failed,
}

/// Why a delivery failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Transient; retried while the budget lasts.
    Retryable,
    /// Never retried.
    Permanent,
    /// The worker did not finish within its lease.
    LeaseExpired,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Retryable => "retryable",
            FailureKind::Permanent => "permanent",
            FailureKind::LeaseExpired => "lease_expired",
        };
        f.write_str(s)
    }
}

/// Persisted state of one job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord<J> {
    pub id: JobId,
    pub payload: J,
    pub state: JobState,
    /// Deliveries so far.
    pub attempts: u32,
    pub enqueued_at: Timestamp,
    /// Earliest time the job may be claimed.
    pub available_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub last_failure: Option<FailureKind>,
}

/// A job handed to a worker. Completing or failing it requires the lease to
/// still be held.
#[derive(Clone, Debug)]
pub struct ClaimedJob<J> {
    pub id: JobId,
    pub queue: String,
    /// 1-based delivery number; identifies the lease.
    pub attempt: u32,
    pub lease_expires_at: Timestamp,
    pub payload: J,
}

/// Structured record of a failed delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub queue: String,
    pub kind: FailureKind,
    pub attempts: u32,
    pub error: String,
    pub failed_at: Timestamp,
}

impl JobFailure {
    /// The failure as an error value, for callers that surface it.
    pub fn to_error(&self) -> FeedError {
        FeedError::PermanentJobFailure {
            queue: self.queue.clone(),
            job_id: self.job_id,
            attempts: self.attempts,
        }
    }
}

/// What the queue did with a failed delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Scheduled for another attempt.
    Retrying { retry_at: Timestamp },
    /// Retained as permanently failed.
    Failed(JobFailure),
}

/// Job counts per state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    /// Jobs not yet finished.
    pub fn pending(&self) -> usize {
        self.waiting + self.delayed + self.active
    }
}
