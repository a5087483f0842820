//! # triton-config: the configuration collaborator
//!
//! A flat TOML table with typed, defaulted lookups. Components ask for the
//! keys they consume with `get(key, default)`; a missing key yields the
//! default, a key of the wrong type logs a warning and yields the default.
//! File parsing is deliberately thin; the framework treats configuration as
//! an external collaborator, not a subsystem.

use std::path::Path;

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// An immutable key/value view of a parsed configuration file.
#[derive(Debug, Clone, Default)]
pub struct Config {
    table: toml::Table,
}

impl Config {
    /// An empty configuration; every lookup yields its default.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a configuration from TOML text.
    pub fn from_str(text: &str) -> ConfigResult<Self> {
        let table = text.parse::<toml::Table>()?;
        Ok(Self { table })
    }

    /// Loads and parses a configuration file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_str(&text)
    }

    /// Returns the value for `key` deserialized as `T`, or `default` when the
    /// key is absent. A present key of the wrong type logs a warning and
    /// falls back to the default.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let Some(value) = self.table.get(key) else {
            return default;
        };
        match value.clone().try_into::<T>() {
            Ok(v) => v,
            Err(e) => {
                triton_log::warning!("config key `{key}` has unexpected type: {e}");
                default
            }
        }
    }

    /// True if `key` is present in the file.
    pub fn contains(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }
}
