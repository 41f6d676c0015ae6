//! End-to-end: stream frames in, feed skeletons out.

use feedgen::{
    AppContext, ClassifierConfig, EventSource, FeedError, FeedGenerator, FeedQuery,
    FeedRegistry, FeedgenConfig, FirehoseSubscription, HealthReport, Result, Shutdown,
    SimulatedClock, ALPHABETIC_WORDS,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn test_config(dir: &TempDir) -> FeedgenConfig {
    let mut config = FeedgenConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.queue.fsync = false;
    config.workers.poll_interval_ms = 20;
    config.subscription.reconnect_delay_ms = 5;
    config
}

// --- Scripted event source ---

type Session = std::result::Result<Vec<Result<Vec<u8>>>, String>;

/// Replays scripted sessions; connects fail once the script runs out.
struct ScriptedSource {
    sessions: VecDeque<Session>,
    cursors: Arc<Mutex<Vec<Option<u64>>>>,
}

impl ScriptedSource {
    fn new(sessions: Vec<Session>) -> (Self, Arc<Mutex<Vec<Option<u64>>>>) {
        let cursors = Arc::new(Mutex::new(Vec::new()));
        let source = Self {
            sessions: sessions.into(),
            cursors: Arc::clone(&cursors),
        };
        (source, cursors)
    }
}

impl EventSource for ScriptedSource {
    type Frames = std::vec::IntoIter<Result<Vec<u8>>>;

    fn connect(&mut self, cursor: Option<u64>) -> Result<Self::Frames> {
        self.cursors.lock().push(cursor);
        match self.sessions.pop_front() {
            Some(Ok(frames)) => Ok(frames.into_iter()),
            Some(Err(reason)) => Err(FeedError::Connection(reason)),
            None => Err(FeedError::Connection("script exhausted".into())),
        }
    }
}

fn commit(seq: u64, ops: Vec<Value>) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&json!({
        "kind": "commit",
        "seq": seq,
        "repo": "did:plc:alice",
        "ops": ops,
    }))
    .unwrap())
}

fn create(rkey: &str, text: &str) -> Value {
    json!({
        "action": "create",
        "path": format!("app.bsky.feed.post/{rkey}"),
        "cid": format!("bafy{rkey}"),
        "record": {"$type": "app.bsky.feed.post", "text": text, "createdAt": "2024-01-01T00:00:00Z"},
    })
}

fn reply(rkey: &str, text: &str) -> Value {
    let mut op = create(rkey, text);
    op["record"]["reply"] = json!({
        "parent": {"uri": "at://did:plc:bob/app.bsky.feed.post/p", "cid": "c1"},
        "root": {"uri": "at://did:plc:bob/app.bsky.feed.post/r", "cid": "c2"},
    });
    op
}

fn delete(rkey: &str) -> Value {
    json!({"action": "delete", "path": format!("app.bsky.feed.post/{rkey}")})
}

fn uri(rkey: &str) -> String {
    format!("at://did:plc:alice/app.bsky.feed.post/{rkey}")
}

fn wait_for(generator: &FeedGenerator, done: impl Fn(&HealthReport) -> bool) -> HealthReport {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let health = generator.health().unwrap();
        if done(&health) {
            return health;
        }
        assert!(Instant::now() < deadline, "timed out waiting: {health:?}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn feed_uris(generator: &FeedGenerator) -> HashSet<String> {
    generator
        .reader()
        .get_feed_skeleton(&FeedQuery::new(ALPHABETIC_WORDS))
        .unwrap()
        .feed
        .into_iter()
        .map(|item| item.post)
        .collect()
}

// --- Tests ---

#[test]
fn test_stream_to_feed() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (source, _cursors) = ScriptedSource::new(vec![Ok(vec![
        commit(
            1,
            vec![
                create("p1", "Apple Banana Cherry"),
                create("p2", "banana apple cherry"),
                reply("p3", "apple banana"),
            ],
        ),
        commit(
            2,
            vec![
                create("p4", "all bears cook"),
                create("p5", "dogs eat fish"),
            ],
        ),
    ])]);

    let mut generator = FeedGenerator::create(test_config(&dir)).unwrap();
    generator.start(source).unwrap();

    let health = wait_for(&generator, |h| {
        h.pending() == 0 && h.posts.get(ALPHABETIC_WORDS) == Some(&3)
    });
    assert_eq!(health.creates.completed, 3);
    assert_eq!(health.failed(), 0);

    let expected: HashSet<String> = ["p1", "p4", "p5"].into_iter().map(uri).collect();
    assert_eq!(feed_uris(&generator), expected);

    // A later delete removes the post
    let frame = commit(3, vec![delete("p4")]).unwrap();
    let report = generator.router().handle_frame(&frame).unwrap().unwrap();
    assert_eq!(report.enqueued_deletes, 1);

    wait_for(&generator, |h| {
        h.pending() == 0 && h.posts.get(ALPHABETIC_WORDS) == Some(&2)
    });
    let expected: HashSet<String> = ["p1", "p5"].into_iter().map(uri).collect();
    assert_eq!(feed_uris(&generator), expected);

    let stats = generator.shutdown().unwrap().unwrap();
    assert_eq!(stats.events, 2);
    assert_eq!(stats.cursor, Some(2));
}

#[test]
fn test_restart_resumes_pending_jobs() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    // Route without workers, then stop
    {
        let ctx = AppContext::open(test_config(&dir)).unwrap();
        let router = ctx.router();
        let frame = commit(1, vec![create("p1", "apple banana"), create("p2", "cats dance")])
            .unwrap();
        router.handle_frame(&frame).unwrap();
        assert_eq!(ctx.health().unwrap().creates.waiting, 2);
    }

    let mut generator = FeedGenerator::create(test_config(&dir)).unwrap();
    generator.start_workers().unwrap();
    wait_for(&generator, |h| {
        h.pending() == 0 && h.posts.get(ALPHABETIC_WORDS) == Some(&2)
    });
    assert_eq!(generator.shutdown().unwrap(), None);
}

#[test]
fn test_subscription_reconnects_from_last_seq() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.subscription.max_reconnect_attempts = Some(2);

    let ctx = AppContext::open_with(
        config.clone(),
        FeedRegistry::with_default_policy(ClassifierConfig::default()),
        Arc::new(SimulatedClock::default()),
    )
    .unwrap();

    let (source, cursors) = ScriptedSource::new(vec![
        Ok(vec![
            commit(10, vec![create("p1", "apple banana")]),
            Ok(b"{not json".to_vec()),
            Ok(br#"{"kind":"identity","seq":11,"did":"did:plc:alice"}"#.to_vec()),
            commit(12, vec![delete("p0")]),
            Err(FeedError::Connection("reset by peer".into())),
            commit(99, vec![]),
        ]),
        Err("refused".into()),
        Ok(vec![commit(13, vec![])]),
    ]);

    let mut subscription = FirehoseSubscription::new(
        source,
        Arc::new(ctx.router()),
        config.subscription.clone(),
        Shutdown::new(),
    );
    let result = subscription.run();

    assert!(matches!(
        result,
        Err(FeedError::ReconnectExhausted { attempts: 2 })
    ));
    assert_eq!(
        *cursors.lock(),
        vec![None, Some(12), Some(12), Some(13), Some(13)]
    );

    let stats = subscription.stats();
    assert_eq!(stats.events, 3);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.cursor, Some(13));

    let health = ctx.health().unwrap();
    assert_eq!(health.creates.waiting, 1);
    assert_eq!(health.deletes.waiting, 1);
}

#[test]
fn test_subscription_stops_on_shutdown() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.subscription.reconnect_delay_ms = 60_000;

    let ctx = AppContext::open(config.clone()).unwrap();
    let (source, cursors) = ScriptedSource::new(vec![]);
    let shutdown = Shutdown::new();

    let mut subscription = FirehoseSubscription::new(
        source,
        Arc::new(ctx.router()),
        config.subscription.clone(),
        shutdown.clone(),
    );
    let handle = std::thread::spawn(move || subscription.run());

    std::thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    shutdown.trigger();

    let stats = handle.join().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(stats.events, 0);
    assert_eq!(cursors.lock().len(), 1);
}

#[test]
fn test_describe_uses_configured_identity() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.hostname = "feeds.example.org".into();
    config.publisher_did = "did:plc:publisher".into();

    let ctx = AppContext::open(config).unwrap();
    let description = ctx.describe();
    assert_eq!(description.did, "did:web:feeds.example.org");
    let uris: Vec<_> = description.feeds.iter().map(|f| f.uri.as_str()).collect();
    assert_eq!(
        uris,
        vec!["at://did:plc:publisher/app.bsky.feed.generator/alphabeticwords"]
    );

    let doc = ctx.did_document().unwrap();
    assert_eq!(doc.id, "did:web:feeds.example.org");
    assert_eq!(doc.service[0].service_endpoint, "https://feeds.example.org");
}
