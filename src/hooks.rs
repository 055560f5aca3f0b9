// SPDX-License-Identifier: MIT OR Apache-2.0

//! Path-addressed forward hooks with activation caching and override.
//!
//! [`HookManager`] indexes a model tree once ([`PathIndex`]) and then
//! attaches callbacks to sub-components by module path. On top of generic
//! registration it provides two capabilities:
//!
//! - **caching**: every output that flows through a path is appended to a
//!   per-path buffer, until the buffer is cleared or drained;
//! - **override**: a per-path slot whose tensor, when set, replaces the
//!   real output on each forward pass.
//!
//! Buffers are unbounded. The driver is expected to drain them
//! periodically ([`take_cache`](HookManager::take_cache),
//! [`clear_all_caches`](HookManager::clear_all_caches)).
//!
//! # Example
//!
//! ```
//! use candle_core::{DType, Device, Tensor};
//! use candle_scope::{HookManager, HookedLayer};
//!
//! let model = HookedLayer::sequential([
//!     ("double", HookedLayer::leaf(|x: &Tensor| x * 2.0)),
//!     ("shift", HookedLayer::leaf(|x: &Tensor| x + 1.0)),
//! ]);
//! let mut scope = HookManager::new(&model).unwrap();
//! scope.add_caching_hook("double").unwrap();
//! scope.add_override_hook("shift").unwrap();
//!
//! let x = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
//! model.forward(&x).unwrap();
//! assert_eq!(scope.cached_len("double").unwrap(), 1);
//!
//! scope.set_override("shift", x.zeros_like().unwrap()).unwrap();
//! let y = model.forward(&x).unwrap();
//! assert_eq!(y.to_vec1::<f32>().unwrap(), vec![0.0, 0.0]);
//! ```
//!
//! # Threading
//!
//! Hook callbacks run inline on the thread driving the forward pass, and
//! share their buffers with the manager through `Rc<RefCell<_>>`. The
//! manager is therefore `!Send`; batch inference spread over threads would
//! need per-thread managers whose buffers are merged afterwards.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use candle_core::Tensor;

use crate::component::{Component, HookHandle};
use crate::error::{Result, ScopeError};
use crate::path::PathIndex;

/// Prefix of the hook name used by [`HookManager::add_caching_hook`].
pub const CACHE_HOOK_PREFIX: &str = "cache-";

/// Prefix of the hook name used by [`HookManager::add_override_hook`].
pub const OVERRIDE_HOOK_PREFIX: &str = "override-";

/// Hook name under which the caching hook for `module_path` is registered.
#[must_use]
pub fn cache_hook_name(module_path: &str) -> String {
    format!("{CACHE_HOOK_PREFIX}{module_path}")
}

/// Hook name under which the override hook for `module_path` is registered.
#[must_use]
pub fn override_hook_name(module_path: &str) -> String {
    format!("{OVERRIDE_HOOK_PREFIX}{module_path}")
}

/// Per-path captured outputs, shared with the caching callbacks.
type ActivationBuffers = Rc<RefCell<HashMap<String, Vec<Tensor>>>>;

/// Per-path replacement outputs, shared with the override callbacks.
type OverrideSlots = Rc<RefCell<HashMap<String, Option<Tensor>>>>;

// ---------------------------------------------------------------------------
// HookRegistration
// ---------------------------------------------------------------------------

/// Bookkeeping for one attached hook.
#[derive(Debug, Clone)]
pub struct HookRegistration {
    /// Caller-chosen identifier.
    hook_name: String,
    /// Path of the sub-component the hook is attached to.
    module_path: String,
    /// Token returned by the component when the hook was attached.
    handle: HookHandle,
}

impl HookRegistration {
    /// Caller-chosen identifier of the hook.
    #[must_use]
    pub fn hook_name(&self) -> &str {
        &self.hook_name
    }

    /// Path of the sub-component the hook is attached to.
    #[must_use]
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    /// Attachment token held by the sub-component.
    #[must_use]
    pub const fn handle(&self) -> HookHandle {
        self.handle
    }
}

// ---------------------------------------------------------------------------
// HookManager
// ---------------------------------------------------------------------------

/// Attaches, tracks, and detaches forward hooks on a borrowed model tree.
///
/// Each manager owns its own registrations, buffers, and slots, so several
/// managers may instrument the same model side by side. Dropping the
/// manager detaches every hook it still has registered.
pub struct HookManager<'m> {
    /// Module path index of the instrumented model.
    index: PathIndex<'m>,
    /// Active registrations keyed by hook name.
    hooks: HashMap<String, HookRegistration>,
    /// Activation buffers keyed by module path.
    activations: ActivationBuffers,
    /// Override slots keyed by module path.
    overrides: OverrideSlots,
}

impl<'m> HookManager<'m> {
    /// Index `model` and start with no hooks attached.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::DuplicatePath`] if the tree yields the same
    /// module path twice.
    pub fn new(model: &'m dyn Component) -> Result<Self> {
        let index = PathIndex::build(model)?;
        tracing::debug!(modules = index.len(), "indexed model tree");
        Ok(Self {
            index,
            hooks: HashMap::new(),
            activations: Rc::new(RefCell::new(HashMap::new())),
            overrides: Rc::new(RefCell::new(HashMap::new())),
        })
    }

    // --- Index -----------------------------------------------------------

    /// All module paths of the model.
    pub fn list_modules(&self) -> impl Iterator<Item = &str> {
        self.index.list_paths()
    }

    /// The sub-component at `module_path`.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownPath`] if the path is not indexed.
    pub fn module(&self, module_path: &str) -> Result<&'m dyn Component> {
        self.index.resolve(module_path)
    }

    /// The underlying path index.
    #[must_use]
    pub const fn index(&self) -> &PathIndex<'m> {
        &self.index
    }

    // --- Generic registration --------------------------------------------

    /// Attach `callback` to the sub-component at `module_path` under
    /// `hook_name`.
    ///
    /// The callback fires on every forward pass through that sub-component
    /// with `(component, input, output)`. Returning `Ok(Some(t))` replaces
    /// the output with `t`; `Ok(None)` leaves it untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownPath`] if the path is not indexed, and
    /// [`ScopeError::DuplicateHook`] if `hook_name` is already registered
    /// (nothing is attached in that case).
    pub fn add_hook<F>(&mut self, callback: F, module_path: &str, hook_name: &str) -> Result<()>
    where
        F: FnMut(&dyn Component, &Tensor, &Tensor) -> Result<Option<Tensor>> + 'static,
    {
        self.check_available(module_path, hook_name)?;
        let module = self.index.resolve(module_path)?;
        let handle = module.register_forward_hook(Box::new(callback))?;
        tracing::debug!(hook = hook_name, path = module_path, %handle, "attached hook");
        self.hooks.insert(
            hook_name.to_owned(),
            HookRegistration {
                hook_name: hook_name.to_owned(),
                module_path: module_path.to_owned(),
                handle,
            },
        );
        Ok(())
    }

    /// Detach the hook registered as `hook_name` and forget it.
    ///
    /// Takes effect from the next forward pass that reaches the hooked
    /// sub-component.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownHook`] if no hook has that name,
    /// including when it was already removed.
    pub fn remove_hook(&mut self, hook_name: &str) -> Result<()> {
        let registration = self
            .hooks
            .get(hook_name)
            .ok_or_else(|| ScopeError::UnknownHook(hook_name.to_owned()))?;
        detach(&self.index, registration)?;
        self.hooks.remove(hook_name);
        Ok(())
    }

    /// Detach and forget every registered hook. No-op when none are.
    ///
    /// # Errors
    ///
    /// Propagates the first detach failure; hooks not yet detached stay
    /// registered.
    pub fn remove_all_hooks(&mut self) -> Result<()> {
        let names: Vec<String> = self.hooks.keys().cloned().collect();
        for name in names {
            self.remove_hook(&name)?;
        }
        Ok(())
    }

    /// Names of all registered hooks, in no particular order.
    pub fn hook_names(&self) -> impl Iterator<Item = &str> {
        self.hooks.keys().map(String::as_str)
    }

    /// Whether a hook is registered as `hook_name`.
    #[must_use]
    pub fn has_hook(&self, hook_name: &str) -> bool {
        self.hooks.contains_key(hook_name)
    }

    /// Bookkeeping for the hook registered as `hook_name`.
    #[must_use]
    pub fn registration(&self, hook_name: &str) -> Option<&HookRegistration> {
        self.hooks.get(hook_name)
    }

    /// Fail unless `module_path` is indexed and `hook_name` is free.
    fn check_available(&self, module_path: &str, hook_name: &str) -> Result<()> {
        if !self.index.contains(module_path) {
            return Err(ScopeError::UnknownPath(module_path.to_owned()));
        }
        if self.hooks.contains_key(hook_name) {
            return Err(ScopeError::DuplicateHook(hook_name.to_owned()));
        }
        Ok(())
    }

    // --- Caching ---------------------------------------------------------

    /// Start recording every output of `module_path`.
    ///
    /// Creates an empty buffer for the path (replacing any buffer left
    /// over from an earlier caching hook) and registers an append-only,
    /// pass-through hook named `"cache-" + module_path`.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownPath`] for an unknown path and
    /// [`ScopeError::DuplicateHook`] if a caching hook is already attached;
    /// the existing buffer is left untouched in both cases.
    pub fn add_caching_hook(&mut self, module_path: &str) -> Result<()> {
        let hook_name = cache_hook_name(module_path);
        self.check_available(module_path, &hook_name)?;

        self.activations
            .borrow_mut()
            .insert(module_path.to_owned(), Vec::new());

        let buffers = Rc::clone(&self.activations);
        let path = module_path.to_owned();
        self.add_hook(
            move |_, _, output| {
                buffers
                    .borrow_mut()
                    .get_mut(&path)
                    .ok_or_else(|| ScopeError::UnknownCache(path.clone()))?
                    .push(output.clone());
                Ok(None)
            },
            module_path,
            &hook_name,
        )
    }

    /// Empty the buffer of `module_path`, keeping the buffer itself.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownCache`] if the path has no buffer.
    pub fn clear_cache(&mut self, module_path: &str) -> Result<()> {
        self.activations
            .borrow_mut()
            .get_mut(module_path)
            .ok_or_else(|| ScopeError::UnknownCache(module_path.to_owned()))?
            .clear();
        Ok(())
    }

    /// Empty every buffer. No-op when there are none.
    pub fn clear_all_caches(&mut self) {
        for buffer in self.activations.borrow_mut().values_mut() {
            buffer.clear();
        }
    }

    /// Delete the buffer of `module_path`.
    ///
    /// The caching hook stays attached: the next forward pass through the
    /// path fails with [`ScopeError::UnknownCache`] until the hook is
    /// removed with [`remove_hook`](Self::remove_hook) or a new buffer is
    /// created. Use [`remove_caching_hook`](Self::remove_caching_hook) to
    /// drop both at once.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownCache`] if the path has no buffer.
    pub fn remove_cache(&mut self, module_path: &str) -> Result<()> {
        self.activations
            .borrow_mut()
            .remove(module_path)
            .map(|_| ())
            .ok_or_else(|| ScopeError::UnknownCache(module_path.to_owned()))
    }

    /// Delete every buffer. Caching hooks stay attached, as with
    /// [`remove_cache`](Self::remove_cache).
    pub fn remove_all_caches(&mut self) {
        self.activations.borrow_mut().clear();
    }

    /// Detach the caching hook of `module_path` and delete its buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownHook`] if no caching hook is attached
    /// at the path.
    pub fn remove_caching_hook(&mut self, module_path: &str) -> Result<()> {
        self.remove_hook(&cache_hook_name(module_path))?;
        self.activations.borrow_mut().remove(module_path);
        Ok(())
    }

    /// Copy of the outputs captured at `module_path`, oldest first.
    ///
    /// Tensors share storage with the captured values; nothing is copied
    /// on device.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownCache`] if the path has no buffer.
    pub fn cached(&self, module_path: &str) -> Result<Vec<Tensor>> {
        self.activations
            .borrow()
            .get(module_path)
            .cloned()
            .ok_or_else(|| ScopeError::UnknownCache(module_path.to_owned()))
    }

    /// Number of outputs captured at `module_path`.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownCache`] if the path has no buffer.
    pub fn cached_len(&self, module_path: &str) -> Result<usize> {
        self.activations
            .borrow()
            .get(module_path)
            .map(Vec::len)
            .ok_or_else(|| ScopeError::UnknownCache(module_path.to_owned()))
    }

    /// Drain the outputs captured at `module_path`, leaving the buffer
    /// empty but present.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownCache`] if the path has no buffer.
    pub fn take_cache(&mut self, module_path: &str) -> Result<Vec<Tensor>> {
        self.activations
            .borrow_mut()
            .get_mut(module_path)
            .map(std::mem::take)
            .ok_or_else(|| ScopeError::UnknownCache(module_path.to_owned()))
    }

    /// Captured outputs of `module_path` concatenated along dim 0.
    ///
    /// # Shapes
    /// - each capture: `[batch, ...]`
    /// - returns: `[sum(batch), ...]`
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownCache`] if the path has no buffer,
    /// [`ScopeError::EmptyCache`] if it holds nothing, and
    /// [`ScopeError::Model`] if the captured shapes do not concatenate.
    pub fn stacked_cache(&self, module_path: &str) -> Result<Tensor> {
        let buffers = self.activations.borrow();
        let buffer = buffers
            .get(module_path)
            .ok_or_else(|| ScopeError::UnknownCache(module_path.to_owned()))?;
        if buffer.is_empty() {
            return Err(ScopeError::EmptyCache(module_path.to_owned()));
        }
        Ok(Tensor::cat(buffer.as_slice(), 0)?)
    }

    /// Module paths that currently have a buffer, sorted.
    #[must_use]
    pub fn cached_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.activations.borrow().keys().cloned().collect();
        paths.sort_unstable();
        paths
    }

    // --- Override --------------------------------------------------------

    /// Make the output of `module_path` overridable.
    ///
    /// Creates an empty slot for the path and registers a hook named
    /// `"override-" + module_path` that substitutes the slot's tensor for
    /// the real output whenever the slot is set, and passes the real output
    /// through otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownPath`] for an unknown path and
    /// [`ScopeError::DuplicateHook`] if an override hook is already
    /// attached.
    pub fn add_override_hook(&mut self, module_path: &str) -> Result<()> {
        let hook_name = override_hook_name(module_path);
        self.check_available(module_path, &hook_name)?;

        self.overrides
            .borrow_mut()
            .insert(module_path.to_owned(), None);

        let slots = Rc::clone(&self.overrides);
        let path = module_path.to_owned();
        self.add_hook(
            move |_, _, _| Ok(slots.borrow().get(&path).cloned().flatten()),
            module_path,
            &hook_name,
        )
    }

    /// Replace the output of `module_path` with `tensor` from the next
    /// forward pass on.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownOverride`] if the path has no slot.
    pub fn set_override(&mut self, module_path: &str, tensor: Tensor) -> Result<()> {
        let mut slots = self.overrides.borrow_mut();
        let slot = slots
            .get_mut(module_path)
            .ok_or_else(|| ScopeError::UnknownOverride(module_path.to_owned()))?;
        *slot = Some(tensor);
        Ok(())
    }

    /// Stop overriding `module_path`; its hook becomes a pass-through.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownOverride`] if the path has no slot.
    pub fn clear_override(&mut self, module_path: &str) -> Result<()> {
        let mut slots = self.overrides.borrow_mut();
        let slot = slots
            .get_mut(module_path)
            .ok_or_else(|| ScopeError::UnknownOverride(module_path.to_owned()))?;
        *slot = None;
        Ok(())
    }

    /// Stop overriding every path. No-op when there are no slots.
    pub fn clear_all_overrides(&mut self) {
        for slot in self.overrides.borrow_mut().values_mut() {
            *slot = None;
        }
    }

    /// Current replacement for `module_path`, `None` when passing through.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownOverride`] if the path has no slot.
    pub fn override_value(&self, module_path: &str) -> Result<Option<Tensor>> {
        self.overrides
            .borrow()
            .get(module_path)
            .cloned()
            .ok_or_else(|| ScopeError::UnknownOverride(module_path.to_owned()))
    }
}

impl Drop for HookManager<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.remove_all_hooks() {
            tracing::warn!(error = %e, "failed to detach hooks on drop");
        }
    }
}

impl fmt::Debug for HookManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hooks: Vec<&str> = self.hook_names().collect();
        hooks.sort_unstable();
        f.debug_struct("HookManager")
            .field("modules", &self.index.len())
            .field("hooks", &hooks)
            .field("caches", &self.cached_paths())
            .finish_non_exhaustive()
    }
}

/// Detach one registration from its sub-component.
fn detach(index: &PathIndex<'_>, registration: &HookRegistration) -> Result<()> {
    let module = index.resolve(&registration.module_path)?;
    if module.remove_forward_hook(registration.handle)? {
        tracing::debug!(
            hook = %registration.hook_name,
            path = %registration.module_path,
            "detached hook"
        );
    } else {
        tracing::warn!(
            hook = %registration.hook_name,
            path = %registration.module_path,
            handle = %registration.handle,
            "hook was no longer attached to its module"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
