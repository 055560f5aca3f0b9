// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: instrument a small candle-nn model end to end.
//!
//! Run:
//!   `cargo test --test instrumentation`

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

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear};
use candle_scope::{
    ActivationCollector, ActivationWindow, CollectionConfig, HookManager, HookedLayer, ScopeError,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const VOCAB: usize = 10;
const HIDDEN: usize = 4;

/// Deterministic weights: `scale * I`.
fn scaled_eye(scale: f64) -> Tensor {
    let data: Vec<f32> = (0..HIDDEN * HIDDEN)
        .map(|i| if i % (HIDDEN + 1) == 0 { scale as f32 } else { 0.0 })
        .collect();
    Tensor::from_vec(data, (HIDDEN, HIDDEN), &Device::Cpu).unwrap()
}

/// `embed -> layers-{0,1}-{attention, mlp} -> norm`, all linear.
fn build_model() -> HookedLayer {
    let table: Vec<f32> = (0..VOCAB * HIDDEN).map(|i| (i % 7) as f32).collect();
    let embed = Embedding::new(
        Tensor::from_vec(table, (VOCAB, HIDDEN), &Device::Cpu).unwrap(),
        HIDDEN,
    );

    let block = |scale: f64| {
        HookedLayer::sequential([
            ("attention", HookedLayer::leaf(Linear::new(scaled_eye(scale), None))),
            ("mlp", HookedLayer::leaf(Linear::new(scaled_eye(1.0), None))),
        ])
    };

    HookedLayer::sequential([
        ("embed", HookedLayer::leaf(embed)),
        (
            "layers",
            HookedLayer::sequential([("0", block(2.0)), ("1", block(3.0))]),
        ),
        ("norm", HookedLayer::leaf(|x: &Tensor| x / 6.0)),
    ])
}

fn tokens(ids: &[u32]) -> Tensor {
    Tensor::new(ids, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
}

fn flat(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn module_paths_cover_the_tree() {
    let model = build_model();
    let scope = HookManager::new(&model).unwrap();
    let mut paths: Vec<&str> = scope.list_modules().collect();
    paths.sort_unstable();
    assert_eq!(
        paths,
        vec![
            "embed",
            "layers",
            "layers-0",
            "layers-0-attention",
            "layers-0-mlp",
            "layers-1",
            "layers-1-attention",
            "layers-1-mlp",
            "norm",
        ]
    );
}

#[test]
fn idle_instrumentation_is_numerically_transparent() {
    let model = build_model();
    let input = tokens(&[1, 2, 3]);
    let reference = flat(&model.forward(&input).unwrap());

    let mut scope = HookManager::new(&model).unwrap();
    let paths: Vec<String> = scope.list_modules().map(str::to_owned).collect();
    for path in &paths {
        scope.add_caching_hook(path).unwrap();
        scope.add_override_hook(path).unwrap();
    }
    assert_eq!(flat(&model.forward(&input).unwrap()), reference);
    for path in &paths {
        assert_eq!(scope.cached_len(path).unwrap(), 1, "{path}");
    }
}

#[test]
fn override_propagates_downstream_and_clears() {
    let model = build_model();
    let input = tokens(&[4]);
    let reference = flat(&model.forward(&input).unwrap());

    let mut scope = HookManager::new(&model).unwrap();
    scope.add_override_hook("layers-0").unwrap();
    scope.add_caching_hook("layers-1-attention").unwrap();

    let ones = Tensor::ones((1, 1, HIDDEN), DType::F32, &Device::Cpu).unwrap();
    scope.set_override("layers-0", ones).unwrap();
    let out = flat(&model.forward(&input).unwrap());
    // ones -> layer 1 (x3) -> norm (/6)
    assert_eq!(out, vec![0.5; HIDDEN]);
    assert_eq!(flat(&scope.cached("layers-1-attention").unwrap()[0]), vec![3.0; HIDDEN]);

    scope.clear_override("layers-0").unwrap();
    assert_eq!(flat(&model.forward(&input).unwrap()), reference);
}

#[test]
fn batch_loop_drains_windows_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = CollectionConfig::from_json(&serde_json::json!({
        "locations": ["layers-1", "embed"],
        "write_every": 3,
        "output_dir": dir.path().join("acts").to_string_lossy(),
    }))
    .unwrap();

    let model = build_model();
    let mut scope = HookManager::new(&model).unwrap();
    let mut collector = ActivationCollector::new(config).unwrap();
    collector.attach(&mut scope).unwrap();

    let mut written = Vec::new();
    for i in 0..7_u32 {
        let batch = tokens(&[i, i + 1]);
        model.forward(&batch).unwrap();
        written.extend(collector.record_batch(&mut scope, &batch).unwrap());
    }
    written.extend(collector.finish(&mut scope).unwrap());

    // Windows of 3, 3, 1 batches for two locations.
    assert_eq!(written.len(), 6);
    assert_eq!(collector.windows_written(), 3);

    let window = ActivationWindow::load(
        dir.path().join("acts").join("layers-1-0.safetensors"),
        &Device::Cpu,
    )
    .unwrap();
    assert_eq!(window.activations.dims(), &[3, 2, HIDDEN]);
    assert_eq!(window.tokens.dims(), &[3, 2]);

    let tail = ActivationWindow::load(
        dir.path().join("acts").join("embed-2.safetensors"),
        &Device::Cpu,
    )
    .unwrap();
    assert_eq!(tail.activations.dims(), &[1, 2, HIDDEN]);
    assert_eq!(tail.tokens.to_vec2::<u32>().unwrap(), vec![vec![6, 7]]);
}

#[test]
fn removing_a_hook_mid_run_affects_only_later_passes() {
    let model = build_model();
    let mut scope = HookManager::new(&model).unwrap();
    scope.add_caching_hook("norm").unwrap();

    model.forward(&tokens(&[1])).unwrap();
    scope.remove_hook("cache-norm").unwrap();
    model.forward(&tokens(&[2])).unwrap();

    assert_eq!(scope.cached_len("norm").unwrap(), 1);
    assert!(matches!(
        scope.remove_hook("cache-norm"),
        Err(ScopeError::UnknownHook(_))
    ));
}
