// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-scope.

/// Errors that can occur while indexing, hooking, or collecting.
///
/// The `Unknown*` variants are lookup failures: a path, hook name, cache,
/// or override slot that the caller named does not exist. They always
/// carry the offending key. See [`ScopeError::is_lookup`].
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    /// No sub-component is indexed under this module path.
    #[error("unknown module path `{0}`")]
    UnknownPath(String),

    /// No hook is registered under this name.
    #[error("unknown hook `{0}`")]
    UnknownHook(String),

    /// No activation buffer exists for this module path.
    #[error("no activation cache for module path `{0}`")]
    UnknownCache(String),

    /// No override slot exists for this module path.
    #[error("no override slot for module path `{0}`")]
    UnknownOverride(String),

    /// Two tree positions produced the same module path.
    #[error("module path `{0}` is produced by more than one sub-component")]
    DuplicatePath(String),

    /// A hook with this name is already registered.
    #[error("hook `{0}` is already registered")]
    DuplicateHook(String),

    /// The activation buffer exists but holds no tensors.
    #[error("activation cache for `{0}` is empty")]
    EmptyCache(String),

    /// Hook attach/detach misuse inside a component binding.
    #[error("hook error: {0}")]
    Hook(String),

    /// Collection configuration parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// A persisted activation window file lacks an expected tensor.
    #[error("malformed activation window: {0}")]
    Window(String),

    /// Forward pass or tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScopeError {
    /// Whether this error is a lookup failure on a caller-supplied key.
    ///
    /// Lookup failures indicate a programming or configuration mistake and
    /// are never worth retrying.
    #[must_use]
    pub const fn is_lookup(&self) -> bool {
        matches!(
            self,
            Self::UnknownPath(_)
                | Self::UnknownHook(_)
                | Self::UnknownCache(_)
                | Self::UnknownOverride(_)
        )
    }
}

/// Result type alias for candle-scope operations.
pub type Result<T> = std::result::Result<T, ScopeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_kind_classification() {
        assert!(ScopeError::UnknownPath("a".into()).is_lookup());
        assert!(ScopeError::UnknownHook("cache-a".into()).is_lookup());
        assert!(ScopeError::UnknownCache("a".into()).is_lookup());
        assert!(ScopeError::UnknownOverride("a".into()).is_lookup());
        assert!(!ScopeError::DuplicateHook("cache-a".into()).is_lookup());
        assert!(!ScopeError::EmptyCache("a".into()).is_lookup());
        assert!(!ScopeError::Window("a-0.safetensors".into()).is_lookup());
    }

    #[test]
    fn messages_carry_the_key() {
        let err = ScopeError::UnknownPath("layers-16-attention".into());
        assert_eq!(err.to_string(), "unknown module path `layers-16-attention`");
    }
}
