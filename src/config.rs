// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation collection configuration and JSON parsing.
//!
//! [`CollectionConfig`] tells an
//! [`ActivationCollector`](crate::ActivationCollector) which module paths
//! to record, how many batches make up one persisted window, and where the
//! window files go.
//!
//! # Usage
//!
//! ```
//! use candle_scope::CollectionConfig;
//!
//! let json = serde_json::json!({
//!     "locations": ["layers-16", "layers-20-attention"],
//!     "write_every": 50,
//!     "output_dir": "activations"
//! });
//! let config = CollectionConfig::from_json(&json).unwrap();
//! assert_eq!(config.write_every, 50);
//! ```

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{Result, ScopeError};

/// Batches per window when `write_every` is not given.
pub const DEFAULT_WRITE_EVERY: usize = 100;

/// Output directory when `output_dir` is not given.
pub const DEFAULT_OUTPUT_DIR: &str = "activations";

// ---------------------------------------------------------------------------
// CollectionConfig
// ---------------------------------------------------------------------------

/// What to record and how often to persist it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionConfig {
    /// Module paths to cache, e.g. `"layers-16"`.
    pub locations: Vec<String>,
    /// Number of batches per persisted window.
    pub write_every: usize,
    /// Directory receiving `{location}-{window}.safetensors` files.
    pub output_dir: PathBuf,
}

impl CollectionConfig {
    /// Build a config for `locations` with the default window size.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Config`] if `locations` is empty or contains
    /// an empty path.
    pub fn new<I, S>(locations: I, output_dir: impl Into<PathBuf>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let config = Self {
            locations: locations.into_iter().map(Into::into).collect(),
            write_every: DEFAULT_WRITE_EVERY,
            output_dir: output_dir.into(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the number of batches per window.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Config`] if `write_every` is zero.
    pub fn with_write_every(mut self, write_every: usize) -> Result<Self> {
        self.write_every = write_every;
        self.validate()?;
        Ok(self)
    }

    /// Parse a config from a JSON object.
    ///
    /// Accepts either `"locations": [..]` or a single `"location": ".."`.
    /// `write_every` defaults to [`DEFAULT_WRITE_EVERY`] and `output_dir`
    /// to [`DEFAULT_OUTPUT_DIR`].
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Config`] if no location is given, a field has
    /// the wrong type, or a value is out of range.
    pub fn from_json(config: &Value) -> Result<Self> {
        let locations = match (config.get("locations"), config.get("location")) {
            (Some(list), _) => get_string_list(list, "locations")?,
            (None, Some(single)) => {
                let location = single.as_str().ok_or_else(|| {
                    ScopeError::Config("field 'location' must be a string".into())
                })?;
                vec![location.to_owned()]
            }
            (None, None) => {
                return Err(ScopeError::Config(
                    "missing 'locations' (or 'location') field".into(),
                ));
            }
        };

        let config = Self {
            locations,
            write_every: get_usize_or(config, "write_every", DEFAULT_WRITE_EVERY)?,
            output_dir: PathBuf::from(get_str_or(config, "output_dir", DEFAULT_OUTPUT_DIR)?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Config`] if the file cannot be read or parsed,
    /// or fails [`from_json`](Self::from_json).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScopeError::Config(format!("read {}: {e}", path.display())))?;
        let json: Value = serde_json::from_str(&text)
            .map_err(|e| ScopeError::Config(format!("parse {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Check value ranges.
    fn validate(&self) -> Result<()> {
        if self.locations.is_empty() {
            return Err(ScopeError::Config("at least one location is required".into()));
        }
        if self.locations.iter().any(String::is_empty) {
            return Err(ScopeError::Config("locations must not be empty strings".into()));
        }
        if self.write_every == 0 {
            return Err(ScopeError::Config("write_every must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> Result<usize> {
    match config.get(key) {
        None => Ok(default),
        Some(value) => {
            let val = value.as_u64().ok_or_else(|| {
                ScopeError::Config(format!("field '{key}' must be a non-negative integer"))
            })?;
            usize::try_from(val).map_err(|_| {
                ScopeError::Config(format!("field '{key}' value {val} overflows usize"))
            })
        }
    }
}

/// Extract an optional string field, returning a default if absent.
fn get_str_or<'a>(config: &'a Value, key: &str, default: &'a str) -> Result<&'a str> {
    match config.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_str()
            .ok_or_else(|| ScopeError::Config(format!("field '{key}' must be a string"))),
    }
}

/// Extract a list of strings.
fn get_string_list(value: &Value, key: &str) -> Result<Vec<String>> {
    value
        .as_array()
        .ok_or_else(|| ScopeError::Config(format!("field '{key}' must be an array")))?
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| ScopeError::Config(format!("field '{key}' must hold strings")))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let json = serde_json::json!({
            "locations": ["layers-16", "layers-20"],
            "write_every": 10,
            "output_dir": "/tmp/acts"
        });
        let config = CollectionConfig::from_json(&json).unwrap();
        assert_eq!(config.locations, vec!["layers-16", "layers-20"]);
        assert_eq!(config.write_every, 10);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/acts"));
    }

    #[test]
    fn single_location_and_defaults() {
        let json = serde_json::json!({ "location": "layers-16" });
        let config = CollectionConfig::from_json(&json).unwrap();
        assert_eq!(config.locations, vec!["layers-16"]);
        assert_eq!(config.write_every, DEFAULT_WRITE_EVERY);
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
    }

    #[test]
    fn missing_locations_errors() {
        let json = serde_json::json!({ "write_every": 10 });
        assert!(matches!(
            CollectionConfig::from_json(&json),
            Err(ScopeError::Config(_))
        ));
    }

    #[test]
    fn empty_locations_errors() {
        let json = serde_json::json!({ "locations": [] });
        assert!(CollectionConfig::from_json(&json).is_err());
        let json = serde_json::json!({ "locations": [""] });
        assert!(CollectionConfig::from_json(&json).is_err());
    }

    #[test]
    fn zero_write_every_errors() {
        let json = serde_json::json!({ "location": "a", "write_every": 0 });
        assert!(CollectionConfig::from_json(&json).is_err());
        let config = CollectionConfig::new(["a"], "out").unwrap();
        assert!(config.with_write_every(0).is_err());
    }

    #[test]
    fn wrong_types_error() {
        let json = serde_json::json!({ "locations": "a" });
        assert!(CollectionConfig::from_json(&json).is_err());
        let json = serde_json::json!({ "location": "a", "write_every": -3 });
        assert!(CollectionConfig::from_json(&json).is_err());
        let json = serde_json::json!({ "location": "a", "output_dir": 7 });
        assert!(CollectionConfig::from_json(&json).is_err());
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collect.json");
        std::fs::write(&path, r#"{"location": "layers-3", "write_every": 2}"#).unwrap();
        let config = CollectionConfig::from_file(&path).unwrap();
        assert_eq!(config.locations, vec!["layers-3"]);
        assert_eq!(config.write_every, 2);

        let missing = dir.path().join("absent.json");
        assert!(matches!(
            CollectionConfig::from_file(&missing),
            Err(ScopeError::Config(_))
        ));
    }
}
