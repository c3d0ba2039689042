//! Metadata store throughput benchmarks.
//!
//! The store takes one write per observed field per record and is guarded
//! by a single mutex (spec §5) — contention only matters once a workload
//! exceeds the single-feeder case this design targets.
//!
//! # Groups
//!
//! | Group | What it measures |
//! |-------|-----------------|
//! | `update` | `update_field_stats` throughput at increasing field counts |
//! | `persist` | snapshot serialization + atomic write cost at increasing field counts |
//! | `concurrent` | multi-threaded update throughput, 1 vs 4 writers |
//!
//! # Viewing results
//!
//! ```sh
//! cargo bench --bench store_bench
//! open target/criterion/report/index.html
//! ```

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use driftline_core::types::DetectedType;
use driftline_core::MetadataStore;
use serde_json::json;
use tempfile::tempdir;

fn update_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("update");

    for field_count in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(field_count as u64));
        group.bench_with_input(
            BenchmarkId::new("update_field_stats", field_count),
            &field_count,
            |b, &n| {
                b.iter(|| {
                    let store = MetadataStore::in_memory();
                    for i in 0..n {
                        let key = format!("field_{i}");
                        store.increment_total_records();
                        store.update_field_stats(&key, DetectedType::String, &json!("value"));
                    }
                    black_box(store.field_count());
                })
            },
        );
    }

    group.finish();
}

fn persist_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("persist");

    for field_count in [100usize, 1_000] {
        group.throughput(Throughput::Elements(field_count as u64));
        group.bench_with_input(
            BenchmarkId::new("save", field_count),
            &field_count,
            |b, &n| {
                let dir = tempdir().unwrap();
                let path = dir.path().join("metadata.json");
                let store = MetadataStore::open(&path, u64::MAX);
                for i in 0..n {
                    let key = format!("field_{i}");
                    store.increment_total_records();
                    store.update_field_stats(&key, DetectedType::Integer, &json!(i));
                }
                b.iter(|| store.save().unwrap())
            },
        );
    }

    group.finish();
}

fn concurrent_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent");

    for writers in [1usize, 4] {
        group.bench_with_input(BenchmarkId::new("writers", writers), &writers, |b, &n| {
            b.iter(|| {
                let store = Arc::new(MetadataStore::in_memory());
                std::thread::scope(|scope| {
                    for t in 0..n {
                        let store = Arc::clone(&store);
                        scope.spawn(move || {
                            for i in 0..1_000 {
                                let key = format!("field_{t}_{}", i % 20);
                                store.increment_total_records();
                                store.update_field_stats(&key, DetectedType::Integer, &json!(i));
                            }
                        });
                    }
                });
                black_box(store.total_records())
            })
        });
    }

    group.finish();
}

criterion_group!(store_benches, update_bench, persist_bench, concurrent_bench);
criterion_main!(store_benches);
