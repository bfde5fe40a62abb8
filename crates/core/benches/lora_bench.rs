//! Criterion benchmarks for adapted layers.
//!
//! Compares the unmerged forward (base plus per-slot corrections) with the
//! merged forward (base op alone) for a dense host, and the cost of gating
//! across a growing number of task slots.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{Device, Tensor};
use cl_lora_core::lora::{
    AdaptationConfig, DenseTransform, LoraContext, LoraLayerConfig, LoraLinear,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Deterministic `[rows, cols]` tensor on CPU.
fn make_tensor(rows: usize, cols: usize) -> Tensor {
    let data: Vec<f32> = (0..rows * cols)
        .map(|i| (i as f32 * 0.013).sin())
        .collect();
    Tensor::from_vec(data, (rows, cols), &Device::Cpu).expect("failed to create tensor")
}

fn make_layer(hidden: usize, rank: usize, adaptation: &AdaptationConfig) -> LoraLinear {
    let base = DenseTransform::new(make_tensor(hidden, hidden), None, false)
        .expect("failed to create dense host");
    let layer = LoraLinear::new(
        base,
        &LoraLayerConfig::new(rank, 2.0 * rank as f64),
        adaptation,
    )
    .expect("failed to create layer");
    for (i, slot) in layer.slots().iter().enumerate() {
        let a = make_tensor(rank, hidden);
        let b = (make_tensor(hidden, rank) * (0.1 * (i + 1) as f64)).expect("scale");
        slot.set_factors(&a, &b).expect("failed to set factors");
    }
    layer
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_merged_vs_unmerged(c: &mut Criterion) {
    let mut group = c.benchmark_group("dense_forward");
    let ctx = LoraContext::default();

    for &hidden in &[256, 1024] {
        let xs = make_tensor(32, hidden);
        let unmerged = make_layer(hidden, 8, &AdaptationConfig::single());
        let mut merged = make_layer(hidden, 8, &AdaptationConfig::single());
        merged.eval().expect("merge failed");

        group.bench_with_input(BenchmarkId::new("unmerged", hidden), &hidden, |b, _| {
            b.iter(|| unmerged.forward(black_box(&xs), &ctx).expect("forward"));
        });
        group.bench_with_input(BenchmarkId::new("merged", hidden), &hidden, |b, _| {
            b.iter(|| merged.forward(black_box(&xs), &ctx).expect("forward"));
        });
    }
    group.finish();
}

fn bench_task_gating(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_task_forward");
    let hidden = 512;
    let xs = make_tensor(16, hidden);

    for &num_tasks in &[2, 8] {
        let layer = make_layer(
            hidden,
            8,
            &AdaptationConfig::multi_task(num_tasks).with_ada_weights(true),
        );
        let ctx = LoraContext::for_task(num_tasks - 1);
        group.bench_with_input(
            BenchmarkId::new("tasks", num_tasks),
            &num_tasks,
            |b, _| {
                b.iter(|| layer.forward(black_box(&xs), &ctx).expect("forward"));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_merged_vs_unmerged, bench_task_gating);
criterion_main!(benches);
