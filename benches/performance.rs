//! Performance benchmarks for publish, fan-out and replay.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tailcast::{Broker, BrokerConfig, FileLog, FileLogConfig, MemoryLog};
use tempfile::TempDir;

/// Publish a message and wait until every subscriber has it.
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for subscribers in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &n| {
                let broker = Broker::start(Arc::new(MemoryLog::new()), BrokerConfig::default()).unwrap();
                let subs: Vec<_> = (0..n).map(|_| broker.subscribe().unwrap()).collect();

                b.iter(|| {
                    broker.publish("benchmark payload").unwrap();
                    for sub in &subs {
                        black_box(sub.recv().unwrap());
                    }
                });

                broker.shutdown().unwrap();
            },
        );
    }

    group.finish();
}

fn bench_publish_file_log(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let log = FileLog::open_with_config(FileLogConfig::new(dir.path().join("log")).with_sync_interval(1000))
        .unwrap();
    let broker = Broker::start(Arc::new(log), BrokerConfig::default()).unwrap();

    c.bench_function("publish_file_log", |b| {
        b.iter(|| black_box(broker.publish("benchmark payload").unwrap()));
    });

    broker.shutdown().unwrap();
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");

    for size in [100, 10_000] {
        let broker = Broker::start(Arc::new(MemoryLog::new()), BrokerConfig::default()).unwrap();
        for i in 0..size {
            broker.publish(&format!("message {}", i)).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("entries", size), &size, |b, _| {
            b.iter(|| black_box(broker.list_messages().unwrap()));
        });

        broker.shutdown().unwrap();
    }

    group.finish();
}

criterion_group!(benches, bench_fan_out, bench_publish_file_log, bench_replay);
criterion_main!(benches);
