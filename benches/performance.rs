//! Performance benchmarks for the feed generator hot paths.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use feedgen::{
    words_in_order, AlphabeticalWords, ClassifierConfig, CreateOp, DeleteJob, DurableQueue,
    FeedPolicy, Post, PostRecord, PostStore, PostTable, QueueConfig, SystemClock, Timestamp,
};
use std::sync::Arc;
use tempfile::TempDir;

fn post(i: usize) -> Post {
    Post {
        uri: format!("at://did:plc:bench/app.bsky.feed.post/{i}"),
        cid: format!("bafy{i:08}"),
        feed: "alphabeticwords".to_string(),
        reply_parent: None,
        reply_root: None,
        indexed_at: Timestamp(1_700_000_000_000 + (i / 4) as i64),
    }
}

/// Benchmark the classifier on matching and non-matching texts
fn bench_classifier(c: &mut Criterion) {
    let mut group = c.benchmark_group("classifier");
    let policy = AlphabeticalWords::new(ClassifierConfig::default());

    let texts = [
        ("match", "all big cats do eat fish going home in june"),
        ("early_reject", "zebra apple banana cherry dates eggs figs grapes"),
        ("late_reject", "all big cats do eat fish going home in apples"),
    ];

    for (name, text) in texts {
        let op = CreateOp {
            uri: "at://did:plc:bench/app.bsky.feed.post/1".into(),
            cid: "bafy1".into(),
            author: "did:plc:bench".into(),
            record: PostRecord::text(text),
        };
        group.bench_with_input(BenchmarkId::new("accept", name), &op, |b, op| {
            b.iter(|| black_box(policy.accept(black_box(op))))
        });
    }

    group.bench_function("words_in_order", |b| {
        b.iter(|| words_in_order(black_box("all big cats do eat fish going home")))
    });

    group.finish();
}

/// Benchmark idempotent inserts into the post table
fn bench_store_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_insert");
    group.sample_size(20);

    group.bench_function("insert_new", |b| {
        let dir = TempDir::new().unwrap();
        let table = PostTable::open(dir.path().join("posts"), false).unwrap();
        let mut i = 0;
        b.iter(|| {
            table.insert_post(post(i)).unwrap();
            i += 1;
        });
    });

    group.bench_function("insert_duplicate", |b| {
        let dir = TempDir::new().unwrap();
        let table = PostTable::open(dir.path().join("posts"), false).unwrap();
        table.insert_post(post(0)).unwrap();
        b.iter(|| black_box(table.insert_post(post(0)).unwrap()));
    });

    group.finish();
}

/// Benchmark page reads at varying table sizes
fn bench_store_page(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_page");

    for rows in [1_000, 10_000, 50_000] {
        let dir = TempDir::new().unwrap();
        let table = PostTable::open(dir.path().join("posts"), false).unwrap();
        for i in 0..rows {
            table.insert_post(post(i)).unwrap();
        }
        let middle = feedgen::Cursor::after(&post(rows / 2));

        group.bench_with_input(BenchmarkId::new("first_page", rows), &rows, |b, _| {
            b.iter(|| black_box(table.page("alphabeticwords", 50, None).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("from_cursor", rows), &rows, |b, _| {
            b.iter(|| black_box(table.page("alphabeticwords", 50, Some(&middle)).unwrap()))
        });
    }

    group.finish();
}

/// Benchmark a full enqueue/claim/complete cycle
fn bench_queue_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    group.sample_size(20);

    group.bench_function("enqueue_claim_complete", |b| {
        let dir = TempDir::new().unwrap();
        let queue: DurableQueue<DeleteJob> = DurableQueue::open(
            dir.path(),
            "deletes",
            QueueConfig {
                fsync: false,
                ..Default::default()
            },
            Arc::new(SystemClock),
        )
        .unwrap();

        b.iter(|| {
            queue
                .enqueue(DeleteJob {
                    uri: "at://did:plc:bench/app.bsky.feed.post/1".into(),
                })
                .unwrap();
            let claimed = queue.claim().unwrap().unwrap();
            queue.complete(&claimed).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_classifier,
    bench_store_insert,
    bench_store_page,
    bench_queue_cycle,
);
criterion_main!(benches);
