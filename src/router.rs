//! Fan-out of commit events onto the job queues.

use crate::classifier::FeedRegistry;
use crate::error::{FeedError, Result};
use crate::queue::{JobSink, CREATES_QUEUE, DELETES_QUEUE};
use crate::stream::decode_frame;
use crate::types::{CommitEvent, CreateJob, DeleteJob, JobId};
use std::sync::Arc;
use std::thread;

/// Outcome of routing one commit event.
#[derive(Debug, Default)]
pub struct RouteReport {
    pub seq: u64,
    pub enqueued_creates: usize,
    pub enqueued_deletes: usize,
    /// Creates no feed accepted.
    pub rejected: usize,
    /// Enqueues that failed. Each is independent of the others.
    pub failures: Vec<FeedError>,
}

impl RouteReport {
    pub fn enqueued(&self) -> usize {
        self.enqueued_creates + self.enqueued_deletes
    }
}

enum Outgoing {
    Create(CreateJob),
    Delete(DeleteJob),
}

impl Outgoing {
    fn queue(&self) -> &'static str {
        match self {
            Outgoing::Create(_) => CREATES_QUEUE,
            Outgoing::Delete(_) => DELETES_QUEUE,
        }
    }
}

/// Classifies creates and enqueues jobs. Holds nothing but queue handles
/// and the feed registry.
pub struct EventRouter {
    registry: FeedRegistry,
    creates: Arc<dyn JobSink<CreateJob>>,
    deletes: Arc<dyn JobSink<DeleteJob>>,
}

impl EventRouter {
    pub fn new(
        registry: FeedRegistry,
        creates: Arc<dyn JobSink<CreateJob>>,
        deletes: Arc<dyn JobSink<DeleteJob>>,
    ) -> Self {
        Self {
            registry,
            creates,
            deletes,
        }
    }

    /// Decode and route a raw frame. Non-commit frames yield `None`.
    pub fn handle_frame(&self, bytes: &[u8]) -> Result<Option<RouteReport>> {
        Ok(decode_frame(bytes)?.map(|event| self.route(&event)))
    }

    /// Enqueue a delete for every deleted post and a create for every
    /// (post, feed) pair a policy accepts.
    ///
    /// Enqueues run concurrently; the call returns once all have settled.
    pub fn route(&self, event: &CommitEvent) -> RouteReport {
        let mut report = RouteReport {
            seq: event.seq,
            ..Default::default()
        };

        let mut jobs: Vec<Outgoing> = event
            .operations
            .deletes
            .iter()
            .map(|op| Outgoing::Delete(DeleteJob { uri: op.uri.clone() }))
            .collect();

        for op in &event.operations.creates {
            let before = jobs.len();
            jobs.extend(
                self.registry
                    .iter()
                    .filter(|policy| policy.accept(op))
                    .map(|policy| Outgoing::Create(policy.project(op))),
            );
            if jobs.len() == before {
                report.rejected += 1;
            }
        }

        let results: Vec<(&'static str, Result<JobId>)> = if jobs.len() <= 1 {
            jobs.into_iter()
                .map(|job| (job.queue(), self.enqueue(job)))
                .collect()
        } else {
            thread::scope(|scope| {
                let handles: Vec<_> = jobs
                    .into_iter()
                    .map(|job| (job.queue(), scope.spawn(move || self.enqueue(job))))
                    .collect();

                handles
                    .into_iter()
                    .map(|(queue, handle)| {
                        let result = handle.join().unwrap_or_else(|_| {
                            Err(FeedError::Enqueue {
                                queue: queue.to_string(),
                                reason: "enqueue thread panicked".into(),
                            })
                        });
                        (queue, result)
                    })
                    .collect()
            })
        };

        for (queue, result) in results {
            match result {
                Ok(_) if queue == CREATES_QUEUE => report.enqueued_creates += 1,
                Ok(_) => report.enqueued_deletes += 1,
                Err(e) => {
                    tracing::warn!(seq = event.seq, queue, error = %e, "failed to enqueue job");
                    report.failures.push(e);
                }
            }
        }

        if report.enqueued() > 0 || !report.failures.is_empty() {
            tracing::debug!(
                seq = event.seq,
                creates = report.enqueued_creates,
                deletes = report.enqueued_deletes,
                rejected = report.rejected,
                failures = report.failures.len(),
                "routed commit"
            );
        }

        report
    }

    fn enqueue(&self, job: Outgoing) -> Result<JobId> {
        match job {
            Outgoing::Create(job) => self.creates.enqueue(job),
            Outgoing::Delete(job) => self.deletes.enqueue(job),
        }
    }
}
