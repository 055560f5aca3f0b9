// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook overhead benchmark: forward pass time with no hooks vs. a caching
//! hook on every module path of a synthetic 12-layer stack.
//!
//! Run:
//!   `cargo test --test hook_overhead --release -- --nocapture`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    missing_docs
)]

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::Linear;
use candle_scope::{HookManager, HookedLayer};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const NUM_LAYERS: usize = 12;
const HIDDEN: usize = 64;
const SEQ_LEN: usize = 16;
const WARMUP_RUNS: usize = 2;
const BENCH_RUNS: usize = 10;

/// Small deterministic weights so activations stay bounded across layers.
fn weight(seed: usize) -> Tensor {
    let data: Vec<f32> = (0..HIDDEN * HIDDEN)
        .map(|i| (((i + seed) % 13) as f32 - 6.0) / (HIDDEN as f32 * 8.0))
        .collect();
    Tensor::from_vec(data, (HIDDEN, HIDDEN), &Device::Cpu).unwrap()
}

/// `layers-{i}-{attention, mlp}` for `NUM_LAYERS` layers, then `norm`.
fn build_stack() -> HookedLayer {
    let layers = (0..NUM_LAYERS).map(|i| {
        let block = HookedLayer::sequential([
            ("attention", HookedLayer::leaf(Linear::new(weight(2 * i), None))),
            ("mlp", HookedLayer::leaf(Linear::new(weight(2 * i + 1), None))),
        ]);
        (i.to_string(), block)
    });
    HookedLayer::sequential([
        ("layers".to_owned(), HookedLayer::sequential(layers)),
        (
            "norm".to_owned(),
            HookedLayer::leaf(|x: &Tensor| x.tanh()),
        ),
    ])
}

// ---------------------------------------------------------------------------
// Benchmark
// ---------------------------------------------------------------------------

#[test]
fn bench_caching_overhead_cpu() {
    let model = build_stack();
    let input = Tensor::ones((1, SEQ_LEN, HIDDEN), DType::F32, &Device::Cpu).unwrap();

    let mut scope = HookManager::new(&model).unwrap();
    let paths: Vec<String> = scope.list_modules().map(str::to_owned).collect();

    println!("\n=== Hook Overhead Benchmark: {NUM_LAYERS}-layer stack (CPU F32) ===");
    println!("  Module paths: {}", paths.len());
    println!("  Warmup: {WARMUP_RUNS} runs, Bench: {BENCH_RUNS} runs\n");

    // --- Warmup ---
    for _ in 0..WARMUP_RUNS {
        let _ = model.forward(&input).unwrap();
    }

    // --- No hooks ---
    let reference = model.forward(&input).unwrap();
    let start = Instant::now();
    for _ in 0..BENCH_RUNS {
        let _ = model.forward(&input).unwrap();
    }
    let no_hooks_avg = start.elapsed() / BENCH_RUNS as u32;

    // --- Full capture ---
    for path in &paths {
        scope.add_caching_hook(path).unwrap();
    }
    let start = Instant::now();
    for _ in 0..BENCH_RUNS {
        let out = model.forward(&input).unwrap();
        let diff: f32 = (out - &reference)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff == 0.0, "capture changed the output by {diff}");
    }
    let full_capture_avg = start.elapsed() / BENCH_RUNS as u32;

    for path in &paths {
        assert_eq!(scope.cached_len(path).unwrap(), BENCH_RUNS, "{path}");
    }

    let overhead_pct = if no_hooks_avg.as_nanos() > 0 {
        ((full_capture_avg.as_nanos() as f64 / no_hooks_avg.as_nanos() as f64) - 1.0) * 100.0
    } else {
        0.0
    };

    println!("  No hooks:     {no_hooks_avg:>8.2?} avg ({BENCH_RUNS} runs)");
    println!(
        "  Full capture: {full_capture_avg:>8.2?} avg ({BENCH_RUNS} runs, {} caches)",
        paths.len()
    );
    println!("  Overhead:     {overhead_pct:>+.1}%\n");

    scope.remove_all_hooks().unwrap();
    assert_eq!(scope.hook_names().count(), 0);
}
