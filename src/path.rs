// SPDX-License-Identifier: MIT OR Apache-2.0

//! Flat index from dash-joined module paths to sub-components.
//!
//! A module path joins the names of a component's ancestors, top-down,
//! with [`PATH_SEPARATOR`]: the child `attention` of child `16` of the
//! root's child `layers` lives at `"layers-16-attention"`. The root itself
//! has no path.

use std::collections::HashMap;
use std::fmt;

use crate::component::Component;
use crate::error::{Result, ScopeError};

/// Separator placed between ancestor names in a module path.
pub const PATH_SEPARATOR: char = '-';

/// Every sub-component of a model tree, addressed by module path.
///
/// Built once from the root by a depth-first walk and read-only
/// afterwards. The index borrows the tree for `'m`, so the tree cannot
/// be mutated or dropped while the index is alive.
pub struct PathIndex<'m> {
    /// Paths in traversal (pre-order) order.
    paths: Vec<String>,
    /// Path to component lookup.
    modules: HashMap<String, &'m dyn Component>,
}

impl<'m> PathIndex<'m> {
    /// Walk the tree under `root` and index every reachable sub-component.
    ///
    /// A parent is indexed before its children; siblings in declaration
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::DuplicatePath`] if two tree positions join to
    /// the same path (duplicate sibling names, or a name containing the
    /// separator that collides with a nested path).
    pub fn build(root: &'m dyn Component) -> Result<Self> {
        let mut index = Self {
            paths: Vec::new(),
            modules: HashMap::new(),
        };
        index.visit(root, "")?;
        Ok(index)
    }

    /// Record the children of `node` under `prefix`, then recurse.
    fn visit(&mut self, node: &'m dyn Component, prefix: &str) -> Result<()> {
        for (name, child) in node.named_children() {
            let path = format!("{prefix}{name}");
            if self.modules.insert(path.clone(), child).is_some() {
                return Err(ScopeError::DuplicatePath(path));
            }
            self.paths.push(path.clone());
            self.visit(child, &format!("{path}{PATH_SEPARATOR}"))?;
        }
        Ok(())
    }

    /// All indexed paths, in traversal order.
    ///
    /// Callers should treat the order as unspecified.
    pub fn list_paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// The sub-component at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownPath`] if `path` is not indexed.
    pub fn resolve(&self, path: &str) -> Result<&'m dyn Component> {
        self.modules
            .get(path)
            .copied()
            .ok_or_else(|| ScopeError::UnknownPath(path.to_owned()))
    }

    /// Whether `path` is indexed.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }

    /// Number of indexed sub-components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether the root has no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl fmt::Debug for PathIndex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.list_paths()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
