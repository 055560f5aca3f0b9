// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-scope
//!
//! Path-addressed forward hooks for [candle](https://github.com/huggingface/candle)
//! models: capture the activations of any named sub-component, override
//! them, and persist captured windows to disk.
//!
//! - [`PathIndex`] — flat map from dash-joined module paths
//!   (`"layers-16-attention"`) to the sub-components of a model tree.
//! - [`HookManager`] — attaches named hooks by path; activation caching,
//!   activation override, and teardown by hook name.
//! - [`Component`] / [`ForwardHooks`] — the contract a model tree must
//!   satisfy, and the hook list bindings embed to satisfy it.
//! - [`HookedLayer`] — candle binding: leaves wrap any
//!   [`candle_core::Module`], containers run named children in order.
//! - [`ActivationCollector`] — drains caches every N batches into
//!   `safetensors` files, configured by [`CollectionConfig`].
//!
//! ## Quick start
//!
//! ```
//! use candle_core::{Device, Tensor};
//! use candle_scope::{HookManager, HookedLayer};
//!
//! let model = HookedLayer::sequential([
//!     ("layers", HookedLayer::sequential([
//!         ("0", HookedLayer::leaf(|x: &Tensor| x * 2.0)),
//!         ("1", HookedLayer::leaf(|x: &Tensor| x + 1.0)),
//!     ])),
//! ]);
//! let mut scope = HookManager::new(&model).unwrap();
//! scope.add_caching_hook("layers-0").unwrap();
//!
//! let x = Tensor::new(&[1.0_f32, 2.0], &Device::Cpu).unwrap();
//! model.forward(&x).unwrap();
//! let captured = scope.cached("layers-0").unwrap();
//! assert_eq!(captured[0].to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
//! ```

#![deny(warnings)]
#![warn(missing_docs)]

pub mod collect;
pub mod component;
pub mod config;
pub mod error;
pub mod hooks;
pub mod layer;
pub mod path;

pub use collect::{ActivationCollector, ActivationWindow};
pub use component::{Component, ForwardHooks, HookFn, HookHandle, hook_fn};
pub use config::CollectionConfig;
pub use error::{Result, ScopeError};
pub use hooks::{HookManager, HookRegistration, cache_hook_name, override_hook_name};
pub use layer::HookedLayer;
pub use path::{PATH_SEPARATOR, PathIndex};
