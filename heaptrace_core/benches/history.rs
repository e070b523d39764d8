//! Write History Benchmarks
//!
//! Measures the two operations on the hot path of the attribution engine:
//!
//! 1. **Append**: a single allocation plus one head CAS per recorded write.
//! 2. **Lookup**: newest-first walk; cost scales with how deep the queried
//!    value sits in the list.
//!
//! # Performance Targets
//!
//! - Uncontended append: < 50ns
//! - Lookup of the newest entry: < 10ns
//! - Lookup at depth 1024: linear, no cliff

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use heaptrace_core::{CauseRef, IdAllocator, WriteHistory};

fn cause(n: u64) -> CauseRef {
    CauseRef::new(n).unwrap()
}

/// Build a history with `n` entries and return the oldest recorded id.
fn filled_history(n: usize) -> (WriteHistory, heaptrace_core::ObjectId) {
    let history = WriteHistory::new();
    let ids = IdAllocator::new();
    let oldest = ids.allocate();
    history.record(oldest, cause(1));
    for _ in 1..n {
        history.record(ids.allocate(), cause(1));
    }
    (history, oldest)
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("history_append");

    group.bench_function("uncontended", |b| {
        let history = WriteHistory::new();
        let ids = IdAllocator::new();
        b.iter(|| history.record(black_box(ids.allocate()), black_box(cause(1))))
    });

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("history_lookup");

    for depth in [1usize, 16, 256, 1024] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::new("depth", depth), &depth, |b, &depth| {
            let (history, oldest) = filled_history(depth);
            // The oldest entry forces a full walk.
            b.iter(|| black_box(history.lookup(black_box(oldest))))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_lookup);
criterion_main!(benches);
