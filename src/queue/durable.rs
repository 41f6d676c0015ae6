//! Journaled job queue.
//!
//! Every state transition is appended to the queue's journal before it is
//! applied in memory, so a reopened queue resumes where the old one stopped.
//! Claims are leases: a job is handed to one worker at a time and comes back
//! if that worker neither completes nor fails it in time. Jobs that were
//! active when the process died are redelivered on open.

use super::types::{
    ClaimedJob, FailureDisposition, FailureKind, JobFailure, JobPayload, JobRecord, JobState,
    QueueConfig, QueueCounts,
};
use crate::clock::Clock;
use crate::error::{FeedError, Result};
use crate::types::{JobId, Timestamp};
use crate::wal::WriteAheadLog;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Magic bytes for queue journals.
const JOURNAL_MAGIC: &[u8; 4] = b"JRN\0";

/// Pending wake-ups buffered for idle workers.
const NOTIFY_CAPACITY: usize = 1024;

/// Longest a waiting claimer sleeps before re-checking delayed jobs and leases.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(100);

/// One journaled transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum JournalEntry<J> {
    Checkpoint {
        next_id: u64,
    },
    Snapshot {
        job: JobRecord<J>,
    },
    Enqueued {
        id: JobId,
        payload: J,
        at: Timestamp,
    },
    Claimed {
        id: JobId,
        attempt: u32,
    },
    Completed {
        id: JobId,
        at: Timestamp,
    },
    Retrying {
        id: JobId,
        attempt: u32,
        kind: FailureKind,
        error: String,
        retry_at: Timestamp,
    },
    Failed {
        id: JobId,
        attempt: u32,
        kind: FailureKind,
        error: String,
        at: Timestamp,
    },
    Removed {
        ids: Vec<JobId>,
    },
}

/// In-memory queue state, rebuilt from the journal on open.
struct QueueState<J> {
    jobs: HashMap<JobId, JobRecord<J>>,
    /// Claimable jobs in FIFO order.
    ready: VecDeque<JobId>,
    /// Jobs waiting for their retry time.
    delayed: BTreeSet<(Timestamp, JobId)>,
    /// Active jobs and their lease expiry.
    leases: HashMap<JobId, Timestamp>,
    /// Finished jobs, oldest first.
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    next_id: u64,
    purged_since_compaction: u64,
}

impl<J> QueueState<J> {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            ready: VecDeque::new(),
            delayed: BTreeSet::new(),
            leases: HashMap::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            next_id: 1,
            purged_since_compaction: 0,
        }
    }

    /// Apply a transition to the job table. Indexes are maintained by callers.
    fn apply(&mut self, entry: JournalEntry<J>) {
        match entry {
            JournalEntry::Checkpoint { next_id } => {
                self.next_id = self.next_id.max(next_id);
            }
            JournalEntry::Snapshot { job } => {
                self.next_id = self.next_id.max(job.id.0 + 1);
                self.jobs.insert(job.id, job);
            }
            JournalEntry::Enqueued { id, payload, at } => {
                self.next_id = self.next_id.max(id.0 + 1);
                self.jobs.insert(
                    id,
                    JobRecord {
                        id,
                        payload,
                        state: JobState::Waiting,
                        attempts: 0,
                        enqueued_at: at,
                        available_at: at,
                        finished_at: None,
                        last_error: None,
                        last_failure: None,
                    },
                );
            }
            JournalEntry::Claimed { id, attempt } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.attempts = attempt;
                    job.state = JobState::Active;
                }
            }
            JournalEntry::Completed { id, at } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.state = JobState::Completed;
                    job.finished_at = Some(at);
                }
            }
            JournalEntry::Retrying {
                id,
                attempt,
                kind,
                error,
                retry_at,
            } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.state = JobState::Delayed;
                    job.attempts = attempt;
                    job.available_at = retry_at;
                    job.last_error = Some(error);
                    job.last_failure = Some(kind);
                }
            }
            JournalEntry::Failed {
                id,
                attempt,
                kind,
                error,
                at,
            } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.state = JobState::Failed;
                    job.attempts = attempt;
                    job.finished_at = Some(at);
                    job.last_error = Some(error);
                    job.last_failure = Some(kind);
                }
            }
            JournalEntry::Removed { ids } => {
                for id in ids {
                    self.jobs.remove(&id);
                }
            }
        }
    }

    /// Rebuild the per-state indexes after replay. Jobs that were active are
    /// made claimable again. Returns how many were.
    fn rebuild_indexes(&mut self) -> usize {
        let mut ids: Vec<JobId> = self.jobs.keys().copied().collect();
        ids.sort();

        let mut redelivered = 0;
        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for id in ids {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            match job.state {
                JobState::Waiting => self.ready.push_back(id),
                JobState::Active => {
                    job.state = JobState::Waiting;
                    self.ready.push_back(id);
                    redelivered += 1;
                }
                JobState::Delayed => {
                    self.delayed.insert((job.available_at, id));
                }
                JobState::Completed => {
                    completed.push((job.finished_at.unwrap_or(job.enqueued_at), id));
                }
                JobState::Failed => {
                    failed.push((job.finished_at.unwrap_or(job.enqueued_at), id));
                }
            }
        }

        completed.sort();
        failed.sort();
        self.completed = completed.into_iter().map(|(_, id)| id).collect();
        self.failed = failed.into_iter().map(|(_, id)| id).collect();

        redelivered
    }

    /// Move delayed jobs whose retry time has come to the ready list.
    fn promote_delayed(&mut self, now: Timestamp) {
        while let Some(&(at, id)) = self.delayed.iter().next() {
            if at > now {
                break;
            }
            self.delayed.remove(&(at, id));
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                self.ready.push_back(id);
            }
        }
    }
}

/// A named, durable, at-least-once job queue.
pub struct DurableQueue<J> {
    name: String,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    journal: WriteAheadLog,
    state: Mutex<QueueState<J>>,
    notify_tx: Sender<()>,
    notify_rx: Receiver<()>,
}

impl<J: JobPayload> DurableQueue<J> {
    /// Open the queue `name` under `dir`, replaying its journal.
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let path = dir.join(format!("{name}.journal"));
        let (journal, entries) =
            WriteAheadLog::open::<JournalEntry<J>>(&path, JOURNAL_MAGIC, config.fsync)?;

        let replayed = entries.len();
        let mut state = QueueState::new();
        for entry in entries {
            state.apply(entry);
        }
        let redelivered = state.rebuild_indexes();

        let (notify_tx, notify_rx) = bounded(NOTIFY_CAPACITY);
        let queue = Self {
            name: name.to_string(),
            config,
            clock,
            journal,
            state: Mutex::new(state),
            notify_tx,
            notify_rx,
        };

        let counts = queue.counts();
        tracing::info!(
            queue = name,
            replayed,
            redelivered,
            waiting = counts.waiting,
            delayed = counts.delayed,
            failed = counts.failed,
            "opened queue"
        );

        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Durably add a job. Once this returns the job survives a restart.
    pub fn enqueue(&self, payload: J) -> Result<JobId> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let id = JobId(state.next_id);
        let entry = JournalEntry::Enqueued {
            id,
            payload,
            at: now,
        };
        self.journal
            .append(&entry)
            .map_err(|e| FeedError::Enqueue {
                queue: self.name.clone(),
                reason: e.to_string(),
            })?;

        state.apply(entry);
        state.ready.push_back(id);
        drop(state);

        // Full means plenty of wake-ups are already pending
        let _ = self.notify_tx.try_send(());

        tracing::debug!(queue = %self.name, job_id = %id, "enqueued job");
        Ok(id)
    }

    /// Claim the oldest ready job, if any, under a fresh lease.
    pub fn claim(&self) -> Result<Option<ClaimedJob<J>>> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        self.expire_leases(&mut state, now)?;
        state.promote_delayed(now);

        while let Some(id) = state.ready.pop_front() {
            let attempt = match state.jobs.get(&id) {
                Some(job) if job.state == JobState::Waiting => job.attempts + 1,
                _ => continue,
            };

            if let Err(e) = self
                .journal
                .append(&JournalEntry::<J>::Claimed { id, attempt })
            {
                state.ready.push_front(id);
                return Err(e);
            }
            state.apply(JournalEntry::Claimed { id, attempt });

            let Some(payload) = state.jobs.get(&id).map(|job| job.payload.clone()) else {
                continue;
            };
            let lease_expires_at = now + self.config.lease();
            state.leases.insert(id, lease_expires_at);

            tracing::debug!(queue = %self.name, job_id = %id, attempt, "claimed job");
            return Ok(Some(ClaimedJob {
                id,
                queue: self.name.clone(),
                attempt,
                lease_expires_at,
                payload,
            }));
        }

        Ok(None)
    }

    /// Claim a job, waiting up to `timeout` for one to become available.
    pub fn claim_timeout(&self, timeout: Duration) -> Result<Option<ClaimedJob<J>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.claim()? {
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = self
                .notify_rx
                .recv_timeout((deadline - now).min(MAX_IDLE_WAIT));
        }
    }

    /// Mark a claimed job as done.
    pub fn complete(&self, claimed: &ClaimedJob<J>) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.validate_lease(&state, claimed)?;

        let entry = JournalEntry::Completed {
            id: claimed.id,
            at: now,
        };
        self.journal.append(&entry)?;
        state.apply(entry);
        state.leases.remove(&claimed.id);
        state.completed.push_back(claimed.id);

        tracing::debug!(
            queue = %self.name,
            job_id = %claimed.id,
            attempt = claimed.attempt,
            "completed job"
        );

        self.prune_locked(&mut state, now)?;
        Ok(())
    }

    /// Report a failed delivery. Retries while the budget lasts unless `kind`
    /// is permanent.
    pub fn fail(
        &self,
        claimed: &ClaimedJob<J>,
        kind: FailureKind,
        error: &str,
    ) -> Result<FailureDisposition> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.validate_lease(&state, claimed)?;

        let disposition = self.record_failure(&mut state, claimed.id, kind, error, now)?;
        self.prune_locked(&mut state, now)?;
        Ok(disposition)
    }

    /// Purge finished jobs that fell out of the retention window.
    pub fn prune(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.prune_locked(&mut state, now)
    }

    /// Rewrite the journal with only the jobs still held.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.compact_locked(&mut state)
    }

    /// Job counts per state.
    pub fn counts(&self) -> QueueCounts {
        let state = self.state.lock();
        QueueCounts {
            waiting: state.ready.len(),
            delayed: state.delayed.len(),
            active: state.leases.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        }
    }

    /// Retained permanent failures, oldest first.
    pub fn failed_jobs(&self) -> Vec<JobFailure> {
        let state = self.state.lock();
        state
            .failed
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .map(|job| JobFailure {
                job_id: job.id,
                queue: self.name.clone(),
                kind: job.last_failure.unwrap_or(FailureKind::Permanent),
                attempts: job.attempts,
                error: job.last_error.clone().unwrap_or_default(),
                failed_at: job.finished_at.unwrap_or(job.enqueued_at),
            })
            .collect()
    }

    /// Snapshot of a retained job.
    pub fn get(&self, id: JobId) -> Option<JobRecord<J>> {
        self.state.lock().jobs.get(&id).cloned()
    }

    fn validate_lease(&self, state: &QueueState<J>, claimed: &ClaimedJob<J>) -> Result<()> {
        match state.jobs.get(&claimed.id) {
            Some(job) if job.state == JobState::Active && job.attempts == claimed.attempt => Ok(()),
            _ => Err(FeedError::StaleLease {
                queue: self.name.clone(),
                job_id: claimed.id,
            }),
        }
    }

    /// Treat every lease that ran out as a failed delivery.
    fn expire_leases(&self, state: &mut QueueState<J>, now: Timestamp) -> Result<()> {
        let mut expired: Vec<JobId> = state
            .leases
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(&id, _)| id)
            .collect();
        expired.sort();

        for id in expired {
            self.record_failure(
                state,
                id,
                FailureKind::LeaseExpired,
                "lease expired before the job finished",
                now,
            )?;
        }
        Ok(())
    }

    fn record_failure(
        &self,
        state: &mut QueueState<J>,
        id: JobId,
        kind: FailureKind,
        error: &str,
        now: Timestamp,
    ) -> Result<FailureDisposition> {
        let attempt = state
            .jobs
            .get(&id)
            .map(|job| job.attempts)
            .ok_or(FeedError::JobNotFound(id))?;

        let retry = kind != FailureKind::Permanent && attempt < self.config.max_attempts;
        if retry {
            let delay = self.config.backoff(attempt);
            let retry_at = now + delay;
            let entry = JournalEntry::Retrying {
                id,
                attempt,
                kind,
                error: error.to_string(),
                retry_at,
            };
            self.journal.append(&entry)?;
            state.apply(entry);
            state.leases.remove(&id);
            state.delayed.insert((retry_at, id));

            tracing::info!(
                queue = %self.name,
                job_id = %id,
                attempt,
                kind = %kind,
                error,
                retry_in_ms = delay.as_millis() as u64,
                "job failed, scheduling retry"
            );
            Ok(FailureDisposition::Retrying { retry_at })
        } else {
            let entry = JournalEntry::Failed {
                id,
                attempt,
                kind,
                error: error.to_string(),
                at: now,
            };
            self.journal.append(&entry)?;
            state.apply(entry);
            state.leases.remove(&id);
            state.failed.push_back(id);

            let failure = JobFailure {
                job_id: id,
                queue: self.name.clone(),
                kind,
                attempts: attempt,
                error: error.to_string(),
                failed_at: now,
            };
            tracing::warn!(
                queue = %failure.queue,
                job_id = %failure.job_id,
                attempts = failure.attempts,
                kind = %failure.kind,
                error = %failure.error,
                "job failed permanently"
            );
            Ok(FailureDisposition::Failed(failure))
        }
    }

    fn prune_locked(&self, state: &mut QueueState<J>, now: Timestamp) -> Result<usize> {
        let completed_max_age = self.config.completed_max_age();
        let failed_max_age = self.config.failed_max_age();
        let mut purged = Vec::new();

        while let Some(&id) = state.completed.front() {
            let over_count = state.completed.len() > self.config.completed_max_count;
            let expired = state
                .jobs
                .get(&id)
                .and_then(|job| job.finished_at)
                .map_or(true, |at| now.saturating_since(at) > completed_max_age);
            if !over_count && !expired {
                break;
            }
            state.completed.pop_front();
            purged.push(id);
        }

        while let Some(&id) = state.failed.front() {
            let expired = state
                .jobs
                .get(&id)
                .and_then(|job| job.finished_at)
                .map_or(true, |at| now.saturating_since(at) > failed_max_age);
            if !expired {
                break;
            }
            state.failed.pop_front();
            purged.push(id);
        }

        if purged.is_empty() {
            return Ok(0);
        }

        let count = purged.len();
        let entry = JournalEntry::<J>::Removed { ids: purged };
        self.journal.append(&entry)?;
        state.apply(entry);
        state.purged_since_compaction += count as u64;

        tracing::debug!(queue = %self.name, purged = count, "purged finished jobs");

        if state.purged_since_compaction >= self.config.compact_after {
            self.compact_locked(state)?;
        }
        Ok(count)
    }

    fn compact_locked(&self, state: &mut QueueState<J>) -> Result<()> {
        let mut jobs: Vec<&JobRecord<J>> = state.jobs.values().collect();
        jobs.sort_by_key(|job| job.id);

        let mut entries = Vec::with_capacity(jobs.len() + 1);
        entries.push(JournalEntry::Checkpoint {
            next_id: state.next_id,
        });
        entries.extend(
            jobs.into_iter()
                .map(|job| JournalEntry::Snapshot { job: job.clone() }),
        );

        self.journal.rewrite(&entries)?;
        state.purged_since_compaction = 0;

        tracing::info!(
            queue = %self.name,
            live_jobs = entries.len() - 1,
            "compacted queue journal"
        );
        Ok(())
    }
}
