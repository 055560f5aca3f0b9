// SPDX-License-Identifier: MIT OR Apache-2.0

//! Collect activations from a toy model into `safetensors` windows.
//!
//! ```bash
//! cargo run --example collect_activations -- [config.json]
//! ```
//!
//! **What it does:**
//!
//! 1. Initialises a tracing subscriber so window writes are logged.
//! 2. Builds a small randomly initialised model from candle-nn layers.
//! 3. Loads a [`CollectionConfig`] from the given JSON file, or defaults to
//!    caching `layers-1` and `layers-2-mlp` into `activations/`.
//! 4. Runs random token batches through the model, letting an
//!    [`ActivationCollector`] write a window every `write_every` batches.
//! 5. Overrides one layer for a final pass to show the override path.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear};
use candle_scope::{ActivationCollector, CollectionConfig, HookManager, HookedLayer};

const VOCAB: usize = 64;
const HIDDEN: usize = 16;
const NUM_LAYERS: usize = 3;
const BATCH: usize = 4;
const SEQ_LEN: usize = 8;
const NUM_BATCHES: usize = 25;

fn main() -> candle_scope::Result<()> {
    // 1. Initialise tracing subscriber so collection events are visible.
    tracing_subscriber::fmt::init();

    let device = Device::Cpu;
    let model = toy_model(&device)?;

    // 2. Configuration.
    let config = match std::env::args().nth(1) {
        Some(path) => CollectionConfig::from_file(path)?,
        None => CollectionConfig::new(["layers-1", "layers-2-mlp"], "activations")?
            .with_write_every(10)?,
    };

    // 3. Instrument.
    let mut scope = HookManager::new(&model)?;
    eprintln!("Modules:");
    for path in scope.list_modules() {
        eprintln!("  {path}");
    }
    let mut collector = ActivationCollector::new(config)?;
    collector.attach(&mut scope)?;

    // 4. Inference loop.
    for _ in 0..NUM_BATCHES {
        let tokens = random_tokens(&device)?;
        model.forward(&tokens)?;
        for path in collector.record_batch(&mut scope, &tokens)? {
            eprintln!("wrote {}", path.display());
        }
    }
    for path in collector.finish(&mut scope)? {
        eprintln!("wrote {}", path.display());
    }
    collector.detach(&mut scope)?;

    // 5. Zero the last layer's MLP output for one pass.
    scope.add_override_hook("layers-2-mlp")?;
    scope.set_override(
        "layers-2-mlp",
        Tensor::zeros((BATCH, SEQ_LEN, HIDDEN), DType::F32, &device)?,
    )?;
    let out = model.forward(&random_tokens(&device)?)?;
    eprintln!(
        "overridden output abs-sum: {}",
        out.abs()?.sum_all()?.to_scalar::<f32>()?
    );
    scope.remove_all_hooks()?;

    Ok(())
}

/// `embed -> layers-{i}-{attention, mlp}` with random weights.
fn toy_model(device: &Device) -> candle_scope::Result<HookedLayer> {
    let embed = Embedding::new(Tensor::randn(0f32, 1.0, (VOCAB, HIDDEN), device)?, HIDDEN);

    let mut layers = Vec::with_capacity(NUM_LAYERS);
    for i in 0..NUM_LAYERS {
        let attention = Linear::new(Tensor::randn(0f32, 0.1, (HIDDEN, HIDDEN), device)?, None);
        let fc = Linear::new(Tensor::randn(0f32, 0.1, (HIDDEN, HIDDEN), device)?, None);
        let mlp = move |x: &Tensor| candle_core::Module::forward(&fc, x)?.gelu();
        layers.push((
            i.to_string(),
            HookedLayer::sequential([
                ("attention", HookedLayer::leaf(attention)),
                ("mlp", HookedLayer::leaf(mlp)),
            ]),
        ));
    }

    Ok(HookedLayer::sequential([
        ("embed", HookedLayer::leaf(embed)),
        ("layers", HookedLayer::sequential(layers)),
    ]))
}

/// A `[BATCH, SEQ_LEN]` batch of random token ids.
fn random_tokens(device: &Device) -> candle_scope::Result<Tensor> {
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let upper = VOCAB as f32;
    let ids = Tensor::rand(0f32, upper, (BATCH, SEQ_LEN), device)?
        .floor()?
        .to_dtype(DType::U32)?;
    Ok(ids)
}
