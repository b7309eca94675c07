//! Microbenchmarks for the collector hot path and batch storage.
//!
//! Measures `record()` overhead with a discarding gateway, and end-to-end
//! `store()` latency for batches with many duplicate keys.
//!
//! Run with: `cargo bench -p tally -- record`

#![allow(missing_docs, clippy::cast_possible_wrap)]

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tally::clock::SharedClock;
use tally::{
    Collector, Entry, FixedClock, Ingest, Lottery, Sample, SqliteStorage, Storage, TallyConfig,
};
use tempfile::tempdir;

const BASE_TIME: i64 = 1_700_000_000;

fn null_collector(buffer: usize) -> Collector {
    let clock: SharedClock = Arc::new(FixedClock::new(BASE_TIME));
    let ingest = Ingest::null(clock.clone()).with_lottery(Lottery::never());
    Collector::new(Arc::new(ingest), clock).with_buffer(buffer)
}

/// A batch of `size` entries spread over `keys` distinct keys.
fn batch(size: usize, keys: usize) -> Vec<Sample> {
    (0..size)
        .map(|i| {
            let key = format!("route_{}", i % keys);
            let mut entry = Entry::new(BASE_TIME, "slow_request", key, Some(i as i64));
            entry.count().max().avg();
            entry.into()
        })
        .collect()
}

fn bench_record_single(c: &mut Criterion) {
    let mut collector = null_collector(1000);

    c.bench_function("record/single_entry", |b| {
        b.iter(|| {
            collector
                .record(black_box("slow_request"), black_box("GET /users"), black_box(Some(1_250)))
                .count()
                .max();
        });
    });
}

fn bench_record_with_buffer_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("record/buffer");

    for buffer in [10, 100, 1000] {
        let mut collector = null_collector(buffer);

        group.bench_with_input(BenchmarkId::from_parameter(buffer), &buffer, |b, _| {
            b.iter(|| {
                collector.record(black_box("job"), black_box("emails"), None).count();
            });
        });
    }

    group.finish();
}

fn bench_store_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/batch_keys");
    let dir = tempdir().unwrap();

    for keys in [1, 10, 100] {
        let clock: SharedClock = Arc::new(FixedClock::new(BASE_TIME));
        let storage = SqliteStorage::open(
            dir.path().join(format!("bench_{keys}.sqlite3")),
            &TallyConfig::default(),
            clock,
        )
        .unwrap();
        let samples = batch(500, keys);

        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, _| {
            b.iter(|| {
                storage.store(black_box(&samples)).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_record_single,
    bench_record_with_buffer_flush,
    bench_store_batch,
);
criterion_main!(benches);
