//! Micro-benchmarks for SampleDB core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- insert    # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use sampledb::memtable::MemtableType;
use sampledb::schema::i64_key_cmp;
use sampledb::tree::{LsmTree, MergePolicy, TreeConfig};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn base_config() -> TreeConfig {
    TreeConfig {
        memtable_capacity: 10_000,
        scale_factor: 8,
        policy: MergePolicy::Leveling,
        memtable_type: MemtableType::Skiplist,
        key_size: 8,
        value_size: 8,
        key_cmp: i64_key_cmp,
        rng_seed: 0,
        ..TreeConfig::default()
    }
}

fn key(k: i64) -> [u8; 8] {
    k.to_be_bytes()
}

/// Open a tree and warm it with `count` sequential keys, flushing so
/// sampling exercises on-disk runs rather than just the memtable.
fn warmed_tree(dir: &std::path::Path, count: i64) -> LsmTree {
    let tree = LsmTree::create(dir, base_config()).expect("create");
    for k in 0..count {
        tree.insert(&key(k), &key(k)).expect("warmup insert");
    }
    tree.flush().expect("warmup flush");
    tree
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

/// Benchmark group for `insert`.
///
/// ## `memtable_only`
///
/// **Scenario:** Sequential inserts into a tree whose memtable is large
/// enough that no merge triggers during measurement.
///
/// **What it measures:** The raw skiplist write path — timestamp
/// assignment plus the lock-free map insert.
///
/// ## `with_merges`
///
/// **Scenario:** Sequential inserts with a small (1000-record) memtable,
/// forcing a background drain roughly every thousand writes.
///
/// **What it measures:** Sustained ingest throughput including the
/// amortized cost of run construction and the merge cascade. Variance
/// is expected when an iteration lands on a memtable switch.
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(1));

    group.bench_function("memtable_only", |b| {
        let dir = TempDir::new().unwrap();
        let mut config = base_config();
        config.memtable_capacity = 4_000_000;
        let tree = LsmTree::create(dir.path(), config).unwrap();
        let mut seq = 0i64;

        b.iter(|| {
            tree.insert(black_box(&key(seq)), black_box(&key(seq))).unwrap();
            seq += 1;
        });
    });

    group.bench_function("with_merges", |b| {
        let dir = TempDir::new().unwrap();
        let mut config = base_config();
        config.memtable_capacity = 1000;
        let tree = LsmTree::create(dir.path(), config).unwrap();
        let mut seq = 0i64;

        b.iter(|| {
            tree.insert(black_box(&key(seq)), black_box(&key(seq))).unwrap();
            seq += 1;
        });
    });

    group.finish();
}

/// Benchmark group for tombstone deletes: an insert-shaped write with
/// the tombstone flag, measured over a pre-populated tree.
fn bench_delete(c: &mut Criterion) {
    let mut group = c.benchmark_group("delete");
    group.throughput(Throughput::Elements(1));

    group.bench_function("tombstone", |b| {
        let dir = TempDir::new().unwrap();
        let tree = warmed_tree(dir.path(), 100_000);
        let mut seq = 0i64;

        b.iter(|| {
            tree.delete(black_box(&key(seq % 100_000)), black_box(&key(seq % 100_000)))
                .unwrap();
            seq += 1;
        });
    });

    group.finish();
}

// ================================================================================================
// Sampling benchmarks
// ================================================================================================

/// Benchmark group for `range_sample` across selectivities.
///
/// **Scenario:** 100k warmed keys; each iteration draws `k = 1000`
/// records from a range covering 1%, 10%, or 100% of the key space.
///
/// **What it measures:** The full sampling pipeline — range
/// enumeration, alias construction, batched page pins, and the
/// rejection loop. Narrow ranges stress per-query setup; wide ranges
/// stress the draw loop and cache behaviour.
fn bench_range_sample(c: &mut Criterion) {
    let population = 100_000i64;
    let sample_size = 1000;

    let dir = TempDir::new().unwrap();
    let tree = warmed_tree(dir.path(), population);

    let mut group = c.benchmark_group("range_sample");
    group.throughput(Throughput::Elements(sample_size as u64));

    for selectivity_pct in [1i64, 10, 100] {
        let hi = population * selectivity_pct / 100 - 1;
        group.bench_function(BenchmarkId::new("selectivity", selectivity_pct), |b| {
            b.iter(|| {
                let sample = tree
                    .range_sample(black_box(&key(0)), black_box(&key(hi)), sample_size)
                    .unwrap()
                    .unwrap();
                black_box(sample.len())
            });
        });
    }

    group.finish();
}

/// Benchmark for sampling with a polluted range: half the keys in the
/// sampled range are tombstoned, so roughly every second draw rejects
/// and redraws.
fn bench_sample_with_rejections(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let tree = warmed_tree(dir.path(), 20_000);
    for k in 0..10_000i64 {
        tree.delete(&key(k), &key(k)).unwrap();
    }
    tree.flush().unwrap();

    let mut group = c.benchmark_group("range_sample_rejections");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("half_deleted", |b| {
        b.iter(|| {
            let sample = tree
                .range_sample(black_box(&key(0)), black_box(&key(19_999)), 1000)
                .unwrap()
                .unwrap();
            black_box(sample.len())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_insert,
    bench_delete,
    bench_range_sample,
    bench_sample_with_rejections
);
criterion_main!(benches);
