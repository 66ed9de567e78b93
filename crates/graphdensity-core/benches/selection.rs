//! Benchmarks for neighborhood construction and greedy selection.
//!
//! Run with:
//! - `cargo bench --bench selection`
//! - `cargo bench --bench selection --features parallel`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use graphdensity_core::{BuildReport, EdgeWeightDecrement, KnnDensityBuilder, KnnDensityConfig};

fn make_points(rows: usize, dims: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut state = seed;
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((state >> 11) as f64) / ((u64::MAX >> 11) as f64)
    };
    (0..rows)
        .map(|_| (0..dims).map(|_| next() * 10.0).collect())
        .collect()
}

fn build_knn(points: &[Vec<f64>]) -> BuildReport<EdgeWeightDecrement> {
    let config = KnnDensityConfig {
        neighbors: 8,
        sigma: 2.0,
        ..KnnDensityConfig::default()
    };
    let mut builder = KnnDensityBuilder::new(config).unwrap();
    for (i, coords) in points.iter().enumerate() {
        builder.add_point(format!("row{i}"), coords.clone()).unwrap();
    }
    builder.build().unwrap()
}

fn bench_knn_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("knn_density_build");
    for (idx, rows) in [64_usize, 256, 1024].iter().enumerate() {
        let points = make_points(*rows, 4, idx as u64 + 1);
        group.bench_with_input(BenchmarkId::new("brute_force", rows), &points, |b, data| {
            b.iter(|| black_box(build_knn(black_box(data))));
        });
    }
    group.finish();
}

fn bench_greedy_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("greedy_selection");
    for (idx, rows) in [256_usize, 1024, 4096].iter().enumerate() {
        let report = build_knn(&make_points(*rows, 4, idx as u64 + 7));
        let budget = rows / 4;

        group.bench_with_input(BenchmarkId::new("select", rows), &report, |b, report| {
            b.iter(|| {
                let mut scorer = report.clone().into_scorer().unwrap();
                black_box(scorer.select(black_box(budget)).unwrap())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_knn_build, bench_greedy_selection);
criterion_main!(benches);
