// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hookable tree of candle modules.
//!
//! [`HookedLayer`] implements [`Component`] for candle: a layer is either a
//! leaf wrapping any [`candle_core::Module`], or a sequential container of
//! named child layers. Every layer carries its own [`ForwardHooks`], which
//! run after the layer's body on each forward pass.
//!
//! ```
//! use candle_core::{DType, Device, Tensor};
//! use candle_scope::HookedLayer;
//!
//! let model = HookedLayer::sequential([
//!     ("double", HookedLayer::leaf(|x: &Tensor| x * 2.0)),
//!     ("shift", HookedLayer::leaf(|x: &Tensor| x + 1.0)),
//! ]);
//! let x = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
//! let y = model.forward(&x).unwrap();
//! assert_eq!(y.to_vec1::<f32>().unwrap(), vec![3.0; 4]);
//! ```

use std::fmt;

use candle_core::{Module, Tensor};

use crate::component::{Component, ForwardHooks, HookFn, HookHandle};
use crate::error::Result;

/// What a layer computes before its hooks run.
enum Body {
    /// A single candle module.
    // TRAIT_OBJECT: leaves wrap arbitrary candle modules
    Leaf(Box<dyn Module>),
    /// Named children applied in order, each feeding the next.
    Sequential(Vec<(String, HookedLayer)>),
}

/// A node of a hookable model tree.
pub struct HookedLayer {
    /// Computation performed by this layer.
    body: Body,
    /// Hooks fired after `body` on every forward pass.
    hooks: ForwardHooks,
}

impl HookedLayer {
    /// Wrap a candle module as a childless layer.
    #[must_use]
    pub fn leaf<M: Module + 'static>(module: M) -> Self {
        Self {
            body: Body::Leaf(Box::new(module)),
            hooks: ForwardHooks::new(),
        }
    }

    /// Build a container that applies `children` in order.
    ///
    /// An empty container is the identity. Sibling names should be
    /// unique; duplicates are reported when the tree is indexed.
    #[must_use]
    pub fn sequential<I, S>(children: I) -> Self
    where
        I: IntoIterator<Item = (S, Self)>,
        S: Into<String>,
    {
        Self {
            body: Body::Sequential(
                children
                    .into_iter()
                    .map(|(name, child)| (name.into(), child))
                    .collect(),
            ),
            hooks: ForwardHooks::new(),
        }
    }

    /// Run the layer: compute the body, then apply this layer's hooks.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Model`](crate::ScopeError::Model) on tensor
    /// failures and propagates any hook error.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let output = match &self.body {
            Body::Leaf(module) => module.forward(x)?,
            Body::Sequential(children) => {
                let mut hidden = x.clone();
                for (_, child) in children {
                    hidden = child.forward(&hidden)?;
                }
                hidden
            }
        };
        self.hooks.run(self, x, output)
    }

    /// Number of hooks currently attached to this layer.
    #[must_use]
    pub fn num_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Look up an immediate child by name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Self> {
        match &self.body {
            Body::Leaf(_) => None,
            Body::Sequential(children) => children
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, child)| child),
        }
    }
}

impl Component for HookedLayer {
    fn named_children(&self) -> Vec<(&str, &dyn Component)> {
        match &self.body {
            Body::Leaf(_) => Vec::new(),
            Body::Sequential(children) => children
                .iter()
                .map(|(name, child)| (name.as_str(), child as &dyn Component))
                .collect(),
        }
    }

    fn register_forward_hook(&self, hook: HookFn) -> Result<HookHandle> {
        self.hooks.register(hook)
    }

    fn remove_forward_hook(&self, handle: HookHandle) -> Result<bool> {
        self.hooks.remove(handle)
    }
}

impl fmt::Debug for HookedLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Body::Leaf(_) => f
                .debug_struct("HookedLayer::Leaf")
                .field("hooks", &self.hooks)
                .finish(),
            Body::Sequential(children) => f
                .debug_struct("HookedLayer::Sequential")
                .field(
                    "children",
                    &children.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
                )
                .field("hooks", &self.hooks)
                .finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
