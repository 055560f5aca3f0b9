// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model contract consumed by the instrumentation layer.
//!
//! [`Component`] is the capability trait a model's sub-components must
//! satisfy: enumerate named children, attach a forward hook, detach it by
//! [`HookHandle`]. [`ForwardHooks`] is the per-component hook list that
//! bindings embed to implement the attach/detach half of the contract.
//!
//! The candle binding in [`crate::layer`] is one implementation; any
//! framework whose modules can run a callback after their forward pass can
//! provide another.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::Tensor;

use crate::error::{Result, ScopeError};

// ---------------------------------------------------------------------------
// Hook callback and handle
// ---------------------------------------------------------------------------

/// Forward hook callback.
///
/// Invoked as `hook(component, input, output)` after `component` computes
/// `output` from `input`. The return value decides what flows downstream:
///
/// - `Ok(Some(tensor))` replaces the component's output,
/// - `Ok(None)` passes the current output through unchanged,
/// - `Err(_)` aborts the forward pass and reaches the caller.
pub type HookFn = Box<dyn FnMut(&dyn Component, &Tensor, &Tensor) -> Result<Option<Tensor>>>;

/// Box a closure as a [`HookFn`].
///
/// Spelling the bound out here lets closures passed to it infer their
/// argument and return types.
#[must_use]
pub fn hook_fn<F>(f: F) -> HookFn
where
    F: FnMut(&dyn Component, &Tensor, &Tensor) -> Result<Option<Tensor>> + 'static,
{
    Box::new(f)
}

/// Opaque token identifying one attached forward hook.
///
/// Returned by [`Component::register_forward_hook`] and consumed by
/// [`Component::remove_forward_hook`]. Handles are unique within the
/// process, so a handle presented to the wrong component never detaches
/// an unrelated hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(u64);

/// Source of process-unique handle ids.
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(0);

impl HookHandle {
    /// Allocate a fresh handle.
    fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric id of this handle.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A node of a model's component tree that can carry forward hooks.
///
/// Implementors must keep their children fixed for as long as they are
/// borrowed by a [`PathIndex`](crate::PathIndex); the borrow held by
/// [`HookManager`](crate::HookManager) makes that a compile-time fact.
pub trait Component {
    /// Immediate named children, in declaration order.
    ///
    /// Names must be unique among siblings.
    fn named_children(&self) -> Vec<(&str, &dyn Component)>;

    /// Attach `hook` so it fires on every forward pass through this
    /// component, after any hooks attached earlier.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Hook`] if the component cannot accept a hook
    /// right now (e.g. it is called from inside one of its own hooks).
    fn register_forward_hook(&self, hook: HookFn) -> Result<HookHandle>;

    /// Detach the hook identified by `handle`.
    ///
    /// Returns `Ok(false)` if no hook with that handle is attached here.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Hook`] if the component cannot detach right now.
    fn remove_forward_hook(&self, handle: HookHandle) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// ForwardHooks
// ---------------------------------------------------------------------------

/// Ordered list of forward hooks attached to one component.
///
/// Bindings embed one of these per hookable component, delegate
/// [`Component::register_forward_hook`] and
/// [`Component::remove_forward_hook`] to it, and call [`run`](Self::run)
/// at the end of their forward pass.
#[derive(Default)]
pub struct ForwardHooks {
    /// Attached hooks in registration order.
    hooks: RefCell<Vec<(HookHandle, HookFn)>>,
}

impl ForwardHooks {
    /// Create an empty hook list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook and return its handle.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Hook`] when called while the hooks are running.
    pub fn register(&self, hook: HookFn) -> Result<HookHandle> {
        let mut hooks = self.hooks.try_borrow_mut().map_err(|_| busy())?;
        let handle = HookHandle::next();
        hooks.push((handle, hook));
        Ok(handle)
    }

    /// Remove the hook identified by `handle`; `Ok(false)` if not present.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Hook`] when called while the hooks are running.
    pub fn remove(&self, handle: HookHandle) -> Result<bool> {
        let mut hooks = self.hooks.try_borrow_mut().map_err(|_| busy())?;
        let before = hooks.len();
        hooks.retain(|(h, _)| *h != handle);
        Ok(hooks.len() != before)
    }

    /// Number of attached hooks (0 while the hooks are running).
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.try_borrow().map_or(0, |hooks| hooks.len())
    }

    /// Whether no hook is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every attached hook over `output`, in registration order.
    ///
    /// Each hook sees the output as left by the hooks before it. With no
    /// hooks attached, `output` is returned as is.
    ///
    /// # Errors
    ///
    /// Propagates the first hook error, and returns [`ScopeError::Hook`]
    /// if the hooks of this component are already running.
    pub fn run(&self, component: &dyn Component, input: &Tensor, output: Tensor) -> Result<Tensor> {
        let mut hooks = self.hooks.try_borrow_mut().map_err(|_| busy())?;
        let mut output = output;
        for (_, hook) in hooks.iter_mut() {
            if let Some(replacement) = hook(component, input, &output)? {
                output = replacement;
            }
        }
        Ok(output)
    }
}

impl fmt::Debug for ForwardHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardHooks")
            .field("len", &self.len())
            .finish()
    }
}

/// Error for touching a hook list while its hooks are executing.
fn busy() -> ScopeError {
    ScopeError::Hook("forward hooks cannot be modified while they are running".into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
