//! Delivery, retry, lease, and retention behaviour of the durable queue.

use feedgen::{
    Clock, DeleteJob, DurableQueue, FailureDisposition, FailureKind, FeedError, JobState,
    QueueConfig, SimulatedClock, Timestamp,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config() -> QueueConfig {
    QueueConfig {
        fsync: false,
        ..Default::default()
    }
}

fn open(dir: &TempDir, config: QueueConfig, clock: &SimulatedClock) -> DurableQueue<DeleteJob> {
    DurableQueue::open(dir.path(), "deletes", config, Arc::new(clock.clone())).unwrap()
}

fn job(n: u32) -> DeleteJob {
    DeleteJob {
        uri: format!("at://did:plc:a/app.bsky.feed.post/{n}"),
    }
}

// --- Retry ---

#[test]
fn test_retry_with_exponential_backoff_then_permanent_failure() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();
    let queue = open(&dir, config(), &clock);
    let start = clock.now();

    let id = queue.enqueue(job(1)).unwrap();

    let first = queue.claim().unwrap().unwrap();
    assert_eq!(first.attempt, 1);
    let disposition = queue.fail(&first, FailureKind::Retryable, "store down").unwrap();
    assert_eq!(
        disposition,
        FailureDisposition::Retrying {
            retry_at: start + Duration::from_secs(1)
        }
    );
    assert_eq!(queue.counts().delayed, 1);

    // Not before the backoff elapses
    clock.advance(Duration::from_millis(999));
    assert!(queue.claim().unwrap().is_none());
    clock.advance(Duration::from_millis(1));

    let second = queue.claim().unwrap().unwrap();
    assert_eq!(second.attempt, 2);
    queue.fail(&second, FailureKind::Retryable, "store down").unwrap();

    // Second retry waits twice as long
    clock.advance(Duration::from_millis(1_999));
    assert!(queue.claim().unwrap().is_none());
    clock.advance(Duration::from_millis(1));

    let third = queue.claim().unwrap().unwrap();
    assert_eq!(third.attempt, 3);
    let disposition = queue.fail(&third, FailureKind::Retryable, "store down").unwrap();

    match disposition {
        FailureDisposition::Failed(failure) => {
            assert_eq!(failure.job_id, id);
            assert_eq!(failure.queue, "deletes");
            assert_eq!(failure.attempts, 3);
            assert_eq!(failure.kind, FailureKind::Retryable);
            assert_eq!(failure.error, "store down");
        }
        other => panic!("expected permanent failure, got {other:?}"),
    }

    let counts = queue.counts();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.pending(), 0);
    assert_eq!(queue.get(id).unwrap().state, JobState::Failed);
    assert_eq!(queue.failed_jobs().len(), 1);
}

#[test]
fn test_permanent_failure_skips_retries() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();
    let queue = open(&dir, config(), &clock);

    queue.enqueue(job(1)).unwrap();
    let claimed = queue.claim().unwrap().unwrap();

    let disposition = queue
        .fail(&claimed, FailureKind::Permanent, "unsupported feed")
        .unwrap();
    assert!(matches!(disposition, FailureDisposition::Failed(ref f) if f.attempts == 1));
    assert_eq!(queue.counts().failed, 1);
}

// --- Leases ---

#[test]
fn test_expired_lease_is_redelivered() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();
    let queue = open(
        &dir,
        QueueConfig {
            lease_ms: 1_000,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            ..config()
        },
        &clock,
    );

    queue.enqueue(job(1)).unwrap();
    let first = queue.claim().unwrap().unwrap();
    assert!(queue.claim().unwrap().is_none());

    clock.advance(Duration::from_millis(1_000));
    let second = queue.claim().unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempt, 2);

    // The first worker's result no longer counts
    assert!(matches!(
        queue.complete(&first),
        Err(FeedError::StaleLease { .. })
    ));
    assert!(matches!(
        queue.fail(&first, FailureKind::Retryable, "late"),
        Err(FeedError::StaleLease { .. })
    ));

    queue.complete(&second).unwrap();
    assert_eq!(queue.counts().completed, 1);

    let record = queue.get(second.id).unwrap();
    assert_eq!(record.last_failure, Some(FailureKind::LeaseExpired));
}

#[test]
fn test_lease_expiry_counts_against_budget() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();
    let queue = open(
        &dir,
        QueueConfig {
            lease_ms: 100,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            max_attempts: 2,
            ..config()
        },
        &clock,
    );

    queue.enqueue(job(1)).unwrap();
    queue.claim().unwrap().unwrap();
    clock.advance(Duration::from_millis(100));
    queue.claim().unwrap().unwrap();
    clock.advance(Duration::from_millis(100));

    assert!(queue.claim().unwrap().is_none());
    let failures = queue.failed_jobs();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::LeaseExpired);
    assert_eq!(failures[0].attempts, 2);
}

#[test]
fn test_huge_lease_never_expires_early() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();
    let queue = open(
        &dir,
        QueueConfig {
            lease_ms: u64::MAX,
            ..config()
        },
        &clock,
    );

    queue.enqueue(job(1)).unwrap();
    let claimed = queue.claim().unwrap().unwrap();

    clock.advance(Duration::from_secs(24 * 3_600));
    assert!(queue.claim().unwrap().is_none());
    assert_eq!(queue.counts().active, 1);

    queue.complete(&claimed).unwrap();
    assert_eq!(queue.counts().completed, 1);
}

// --- Durability ---

#[test]
fn test_jobs_survive_reopen_and_active_jobs_are_redelivered() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();

    let (completed_id, active_id) = {
        let queue = open(&dir, config(), &clock);
        let a = queue.enqueue(job(1)).unwrap();
        let b = queue.enqueue(job(2)).unwrap();
        queue.enqueue(job(3)).unwrap();

        let claimed = queue.claim().unwrap().unwrap();
        assert_eq!(claimed.id, a);
        queue.complete(&claimed).unwrap();

        // Claimed, then the process dies
        let claimed = queue.claim().unwrap().unwrap();
        assert_eq!(claimed.id, b);
        (a, b)
    };

    let queue = open(&dir, config(), &clock);
    let counts = queue.counts();
    assert_eq!(counts.waiting, 2);
    assert_eq!(counts.active, 0);
    assert_eq!(counts.completed, 1);
    assert_eq!(queue.get(completed_id).unwrap().state, JobState::Completed);

    let redelivered = queue.claim().unwrap().unwrap();
    assert_eq!(redelivered.id, active_id);
    assert_eq!(redelivered.attempt, 2);
    assert_eq!(redelivered.payload, job(2));

    let next = queue.claim().unwrap().unwrap();
    assert_eq!(next.payload, job(3));
}

#[test]
fn test_delayed_retry_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();

    {
        let queue = open(&dir, config(), &clock);
        queue.enqueue(job(1)).unwrap();
        let claimed = queue.claim().unwrap().unwrap();
        queue.fail(&claimed, FailureKind::Retryable, "io").unwrap();
    }

    let queue = open(&dir, config(), &clock);
    assert_eq!(queue.counts().delayed, 1);
    assert!(queue.claim().unwrap().is_none());

    clock.advance(Duration::from_secs(1));
    let claimed = queue.claim().unwrap().unwrap();
    assert_eq!(claimed.attempt, 2);
}

// --- Retention ---

#[test]
fn test_completed_jobs_bounded_by_count() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();
    let queue = open(
        &dir,
        QueueConfig {
            completed_max_count: 2,
            ..config()
        },
        &clock,
    );

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(queue.enqueue(job(n)).unwrap());
        let claimed = queue.claim().unwrap().unwrap();
        queue.complete(&claimed).unwrap();
    }

    assert_eq!(queue.counts().completed, 2);
    assert!(queue.get(ids[0]).is_none());
    assert!(queue.get(ids[2]).is_none());
    assert!(queue.get(ids[3]).is_some());
    assert!(queue.get(ids[4]).is_some());
}

#[test]
fn test_completed_jobs_expire_after_an_hour() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();
    let queue = open(&dir, config(), &clock);

    queue.enqueue(job(1)).unwrap();
    let claimed = queue.claim().unwrap().unwrap();
    queue.complete(&claimed).unwrap();

    clock.advance(Duration::from_secs(3_600));
    assert_eq!(queue.prune().unwrap(), 0);

    clock.advance(Duration::from_millis(1));
    assert_eq!(queue.prune().unwrap(), 1);
    assert_eq!(queue.counts().completed, 0);
}

#[test]
fn test_failed_jobs_kept_for_a_day() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();
    let queue = open(&dir, config(), &clock);

    queue.enqueue(job(1)).unwrap();
    let claimed = queue.claim().unwrap().unwrap();
    queue.fail(&claimed, FailureKind::Permanent, "bad").unwrap();

    clock.advance(Duration::from_secs(2 * 3_600));
    queue.prune().unwrap();
    assert_eq!(queue.failed_jobs().len(), 1);

    clock.set(Timestamp(clock.now().as_millis() + 22 * 3_600 * 1_000 + 1));
    queue.prune().unwrap();
    assert!(queue.failed_jobs().is_empty());
}

#[test]
fn test_pruned_jobs_stay_gone_after_reopen() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();
    let cfg = QueueConfig {
        completed_max_count: 1,
        ..config()
    };

    {
        let queue = open(&dir, cfg.clone(), &clock);
        for n in 0..3 {
            queue.enqueue(job(n)).unwrap();
            let claimed = queue.claim().unwrap().unwrap();
            queue.complete(&claimed).unwrap();
        }
        queue.compact().unwrap();
    }

    let queue = open(&dir, cfg, &clock);
    assert_eq!(queue.counts().completed, 1);
    assert_eq!(queue.counts().pending(), 0);
}

// --- Blocking claim ---

#[test]
fn test_claim_timeout_wakes_on_enqueue() {
    let dir = TempDir::new().unwrap();
    let clock = SimulatedClock::default();
    let queue = Arc::new(open(&dir, config(), &clock));

    assert!(queue
        .claim_timeout(Duration::from_millis(20))
        .unwrap()
        .is_none());

    let producer = Arc::clone(&queue);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        producer.enqueue(job(9)).unwrap();
    });

    let claimed = queue.claim_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(claimed.payload, job(9));
    handle.join().unwrap();
}
