// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batch-window activation collection to `safetensors` files.
//!
//! [`ActivationCollector`] is the persistence driver around a
//! [`HookManager`]: it attaches caching hooks at the configured locations,
//! keeps the token batches fed to the model, and every `write_every`
//! batches concatenates each location's captures and writes
//!
//! ```text
//! {output_dir}/{location}-{window}.safetensors
//!     activations: [sum(batch), ...]   captures, oldest first
//!     tokens:      [sum(batch), seq]   token batches, same order
//! ```
//!
//! then clears the caches so memory stays bounded by one window. A window
//! that cannot be persisted (e.g. batches of different sequence lengths)
//! is kept, and every later flush fails on it until it is dropped with
//! [`ActivationCollector::discard`].
//!
//! ```no_run
//! # fn run(model: &candle_scope::HookedLayer, batches: Vec<candle_core::Tensor>)
//! #     -> candle_scope::Result<()> {
//! use candle_scope::{ActivationCollector, CollectionConfig, HookManager};
//!
//! let config = CollectionConfig::new(["layers-16"], "activations")?.with_write_every(100)?;
//! let mut scope = HookManager::new(model)?;
//! let mut collector = ActivationCollector::new(config)?;
//! collector.attach(&mut scope)?;
//! for tokens in &batches {
//!     model.forward(tokens)?;
//!     collector.record_batch(&mut scope, tokens)?;
//! }
//! collector.finish(&mut scope)?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use crate::config::CollectionConfig;
use crate::error::{Result, ScopeError};
use crate::hooks::HookManager;

/// Tensor name of the concatenated captures in a window file.
pub const ACTIVATIONS_KEY: &str = "activations";

/// Tensor name of the concatenated token batches in a window file.
pub const TOKENS_KEY: &str = "tokens";

/// File name of window `window` for `location`.
#[must_use]
pub fn window_file_name(location: &str, window: usize) -> String {
    format!("{location}-{window}.safetensors")
}

// ---------------------------------------------------------------------------
// ActivationCollector
// ---------------------------------------------------------------------------

/// Drains caching hooks into window files every `write_every` batches.
#[derive(Debug)]
pub struct ActivationCollector {
    /// Locations, window size, output directory.
    config: CollectionConfig,
    /// Token batches of the current window.
    tokens: Vec<Tensor>,
    /// Batches recorded since creation.
    batches_seen: usize,
    /// Windows persisted since creation; also the next window's number.
    windows_written: usize,
}

impl ActivationCollector {
    /// Create a collector and its output directory.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Io`] if the directory cannot be created.
    pub fn new(config: CollectionConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir)?;
        Ok(Self {
            config,
            tokens: Vec::new(),
            batches_seen: 0,
            windows_written: 0,
        })
    }

    /// The collector's configuration.
    #[must_use]
    pub const fn config(&self) -> &CollectionConfig {
        &self.config
    }

    /// Batches recorded so far.
    #[must_use]
    pub const fn batches_seen(&self) -> usize {
        self.batches_seen
    }

    /// Windows persisted so far.
    #[must_use]
    pub const fn windows_written(&self) -> usize {
        self.windows_written
    }

    /// Batches recorded since the last persisted window.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.tokens.len()
    }

    /// Add a caching hook at every configured location.
    ///
    /// # Errors
    ///
    /// Propagates [`HookManager::add_caching_hook`] failures (unknown path,
    /// caching hook already attached).
    pub fn attach(&self, scope: &mut HookManager<'_>) -> Result<()> {
        for location in &self.config.locations {
            scope.add_caching_hook(location)?;
        }
        tracing::info!(
            locations = ?self.config.locations,
            write_every = self.config.write_every,
            output_dir = %self.config.output_dir.display(),
            "collecting activations"
        );
        Ok(())
    }

    /// Remove the caching hooks and buffers added by [`attach`](Self::attach).
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownHook`] if a location's caching hook is
    /// no longer registered.
    pub fn detach(&self, scope: &mut HookManager<'_>) -> Result<()> {
        for location in &self.config.locations {
            scope.remove_caching_hook(location)?;
        }
        Ok(())
    }

    /// Record the token batch that was just fed to the model.
    ///
    /// Call once per forward pass, after it. When the window is full, it is
    /// persisted and the written file paths are returned; otherwise the
    /// returned list is empty.
    ///
    /// # Shapes
    /// - `tokens`: `[batch, seq]`
    ///
    /// # Errors
    ///
    /// Propagates [`flush`](Self::flush) failures.
    pub fn record_batch(
        &mut self,
        scope: &mut HookManager<'_>,
        tokens: &Tensor,
    ) -> Result<Vec<PathBuf>> {
        self.tokens.push(tokens.clone());
        self.batches_seen += 1;
        tracing::debug!(
            batch = self.batches_seen,
            pending = self.tokens.len(),
            "recorded batch"
        );
        if self.tokens.len() >= self.config.write_every {
            self.flush(scope)
        } else {
            Ok(Vec::new())
        }
    }

    /// Persist the current window and clear the collector's caches.
    ///
    /// No-op, returning an empty list, when no batch is pending. Every
    /// location's tensors are assembled before any file is written, so a
    /// failing location leaves no file of this window behind.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownCache`] / [`ScopeError::EmptyCache`] if a
    /// location captured nothing, [`ScopeError::Model`] if tensors cannot be
    /// concatenated or saved. On error the window is kept; retry, or drop
    /// it with [`discard`](Self::discard).
    pub fn flush(&mut self, scope: &mut HookManager<'_>) -> Result<Vec<PathBuf>> {
        if self.tokens.is_empty() {
            return Ok(Vec::new());
        }

        let tokens = Tensor::cat(self.tokens.as_slice(), 0)?;
        let mut window = Vec::with_capacity(self.config.locations.len());
        for location in &self.config.locations {
            let activations = scope.stacked_cache(location)?;
            let path = self
                .config
                .output_dir
                .join(window_file_name(location, self.windows_written));
            window.push((location, path, activations));
        }

        let mut written = Vec::with_capacity(window.len());
        for (location, path, activations) in window {
            let tensors = HashMap::from([
                (ACTIVATIONS_KEY.to_owned(), activations),
                (TOKENS_KEY.to_owned(), tokens.clone()),
            ]);
            candle_core::safetensors::save(&tensors, &path)?;
            tracing::info!(
                location = %location,
                window = self.windows_written,
                batches = self.tokens.len(),
                path = %path.display(),
                "wrote activation window"
            );
            written.push(path);
        }

        self.reset(scope)?;
        self.windows_written += 1;
        Ok(written)
    }

    /// Drop the current window without writing it.
    ///
    /// Clears the pending token batches and the caches of every configured
    /// location. This is the way out of a window that [`flush`](Self::flush)
    /// keeps rejecting. The window number is not advanced.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownCache`] if a location's buffer was
    /// removed behind the collector's back.
    pub fn discard(&mut self, scope: &mut HookManager<'_>) -> Result<()> {
        let dropped = self.tokens.len();
        self.reset(scope)?;
        tracing::warn!(
            window = self.windows_written,
            batches = dropped,
            "discarded activation window"
        );
        Ok(())
    }

    /// Empty the pending batches and the collector's caches.
    fn reset(&mut self, scope: &mut HookManager<'_>) -> Result<()> {
        self.tokens.clear();
        for location in &self.config.locations {
            scope.clear_cache(location)?;
        }
        Ok(())
    }

    /// Persist the trailing partial window, if any.
    ///
    /// # Errors
    ///
    /// Propagates [`flush`](Self::flush) failures.
    pub fn finish(&mut self, scope: &mut HookManager<'_>) -> Result<Vec<PathBuf>> {
        let written = self.flush(scope)?;
        tracing::info!(
            batches = self.batches_seen,
            windows = self.windows_written,
            "activation collection finished"
        );
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// ActivationWindow
// ---------------------------------------------------------------------------

/// One persisted window, read back from disk.
#[derive(Debug)]
pub struct ActivationWindow {
    /// Captures of the window, concatenated along dim 0.
    pub activations: Tensor,
    /// Token batches of the window, concatenated along dim 0.
    pub tokens: Tensor,
}

impl ActivationWindow {
    /// Load a window file written by [`ActivationCollector`].
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Model`] if the file is not valid `safetensors`
    /// and [`ScopeError::Window`] if a tensor is missing.
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let mut take = |key: &str| {
            tensors.remove(key).ok_or_else(|| {
                ScopeError::Window(format!("{} has no '{key}' tensor", path.display()))
            })
        };
        Ok(Self {
            activations: take(ACTIVATIONS_KEY)?,
            tokens: take(TOKENS_KEY)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
