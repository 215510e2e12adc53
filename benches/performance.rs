//! Performance benchmarks for the subscription manager.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use partial_sync::{
    plan_removal, Intent, MemoryGraph, ObjectGraph, ObjectId, OfflineQueue, QuerySpec,
    RecordingTransport, Registry, Session, SessionConfig, SubscriptionId, SubscriptionIntent,
    Timestamp,
};
use std::sync::Arc;
use tempfile::TempDir;

fn online_session() -> Session {
    Session::new(
        SessionConfig {
            start_online: true,
            ..Default::default()
        },
        Arc::new(RecordingTransport::new()),
        Arc::new(MemoryGraph::new()),
    )
    .unwrap()
}

/// Benchmark query canonicalization
fn bench_fingerprint(c: &mut Criterion) {
    let query = QuerySpec::new("Dog")
        .filter("  age >   3 AND name == 'Rex  the dog' ")
        .sorted_by(partial_sync::SortKey::desc("age"))
        .distinct_on("name")
        .limit(25);

    c.bench_function("fingerprint", |b| {
        b.iter(|| black_box(query.fingerprint().unwrap()));
    });
}

/// Benchmark dedup lookups against a populated session
fn bench_subscribe_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscribe_dedup");

    for live in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("live", live), &live, |b, &live| {
            let session = online_session();
            for i in 0..live {
                session
                    .subscribe(&QuerySpec::new("Item").filter(format!("n == {}", i)), None)
                    .unwrap();
            }
            let query = QuerySpec::new("Item").filter(format!("n == {}", live / 2));

            b.iter(|| black_box(session.subscribe(&query, None).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark removal planning with overlapping result sets
fn bench_plan_removal(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_removal");

    for subscriptions in [10, 100, 500] {
        group.bench_with_input(
            BenchmarkId::new("subscriptions", subscriptions),
            &subscriptions,
            |b, &count| {
                let graph = MemoryGraph::new();
                let mut registry = Registry::new();

                // Each query matches a window of 50 objects overlapping the next.
                for i in 0..count as u64 {
                    let predicate = format!("bucket == {}", i);
                    let ids = (i * 25..i * 25 + 50).map(ObjectId);
                    graph.define_results("Item", &predicate, ids).unwrap();
                    for id in i * 25..i * 25 + 50 {
                        graph.link(ObjectId(id), ObjectId(1_000_000 + id));
                    }
                    let fingerprint = QuerySpec::new("Item")
                        .filter(predicate)
                        .fingerprint()
                        .unwrap();
                    registry.insert(None, fingerprint, Timestamp(i as i64));
                }

                let snapshot = graph.snapshot();
                let target = SubscriptionId((count / 2) as u64 + 1);
                b.iter(|| black_box(plan_removal(&registry, target, snapshot.as_ref())));
            },
        );
    }

    group.finish();
}

/// Benchmark durable queue appends
fn bench_queue_enqueue(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut queue = OfflineQueue::open(dir.path().join("queue.bin")).unwrap();
    let fingerprint = QuerySpec::new("Dog").fingerprint().unwrap();
    let mut next = 0u64;

    c.bench_function("queue_enqueue_complete", |b| {
        b.iter(|| {
            next += 1;
            let seq = queue
                .enqueue(Intent::Subscribe(SubscriptionIntent {
                    id: SubscriptionId(next),
                    name: None,
                    fingerprint: fingerprint.clone(),
                    created: Timestamp(next as i64),
                }))
                .unwrap();
            black_box(queue.complete(seq).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_fingerprint,
    bench_subscribe_dedup,
    bench_plan_removal,
    bench_queue_enqueue,
);

criterion_main!(benches);
