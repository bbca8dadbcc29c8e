//! `ivfbin` Configuration Module
//!
//! Provides configuration file support via `ivfbin.toml`, environment variables,
//! and runtime overrides.
//!
//! # Priority (highest to lowest)
//!
//! 1. Runtime overrides (per-call [`SearchParams`], index setters)
//! 2. Environment variables (`IVFBIN_<SECTION>__<KEY>`)
//! 3. Configuration file (`ivfbin.toml`)
//! 4. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const MIB: usize = 1024 * 1024;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration file.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key that failed validation.
        key: String,
        /// Validation error message.
        message: String,
    },
}

/// Search-time parameters.
///
/// Used both as the index defaults and as a per-call override.
/// Changes made through the index setters apply to the next search only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Number of inverted lists probed per query.
    pub nprobe: usize,
    /// Maximum codes scanned per query across all probed lists (0 = unlimited).
    pub max_codes: usize,
    /// Heap selection when true, counting selection otherwise.
    pub use_heap: bool,
    /// Scan list by list for the whole batch instead of query by query.
    pub per_invlist_search: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            nprobe: 1,
            max_codes: 0,
            use_heap: true,
            per_invlist_search: false,
        }
    }
}

impl SearchParams {
    /// Returns the scan budget per query, `None` when unlimited.
    #[must_use]
    pub fn code_budget(&self) -> Option<usize> {
        (self.max_codes > 0).then_some(self.max_codes)
    }
}

/// Paging configuration for host-resident query batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Host batches up to this many bytes are searched without paging.
    pub min_paged_bytes: usize,
    /// Chunk size in bytes when pinned staging is unavailable.
    pub page_bytes: usize,
    /// Pinned staging budget split across the double buffer (0 = disabled).
    pub pinned_staging_bytes: usize,
    /// Retry once with half-sized chunks on device OOM.
    pub retry_on_oom: bool,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            min_paged_bytes: 256 * MIB,
            page_bytes: 64 * MIB,
            pinned_staging_bytes: 256 * MIB,
            retry_on_oom: true,
        }
    }
}

/// Device resource configuration for [`crate::resources::StandardResources`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device memory capacity in bytes.
    pub memory_bytes: usize,
    /// Pinned host memory capacity in bytes.
    pub pinned_memory_bytes: usize,
    /// Number of command streams in the pool.
    pub streams: usize,
    /// Number of compute handles in the pool.
    pub handles: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 4096 * MIB,
            pinned_memory_bytes: 256 * MIB,
            streams: 2,
            handles: 2,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Main `ivfbin` configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IvfConfig {
    /// Default search parameters.
    pub search: SearchParams,
    /// Paging configuration.
    pub paging: PagingConfig,
    /// Device configuration.
    pub device: DeviceConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl IvfConfig {
    /// Loads configuration from default sources.
    ///
    /// Priority: defaults < file < environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("ivfbin.toml")
    }

    /// Loads configuration from a specific file path.
    ///
    /// Environment keys use a double underscore between section and key,
    /// e.g. `IVFBIN_SEARCH__MAX_CODES=512`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("IVFBIN_").split("__"));

        figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Creates a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml_str));

        figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validates the configuration.
    ///
    /// `search.nprobe` is only checked against its lower bound here; the
    /// upper bound depends on `nlist` and is enforced by the index.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.search.nprobe == 0 {
            return Err(ConfigError::InvalidValue {
                key: "search.nprobe".to_string(),
                message: "value must be >= 1".to_string(),
            });
        }

        if self.paging.page_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "paging.page_bytes".to_string(),
                message: "value must be > 0".to_string(),
            });
        }

        if self.device.memory_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "device.memory_bytes".to_string(),
                message: "value must be > 0".to_string(),
            });
        }

        if self.device.streams == 0 || self.device.handles == 0 {
            return Err(ConfigError::InvalidValue {
                key: "device.streams".to_string(),
                message: format!(
                    "streams ({}) and handles ({}) must both be >= 1",
                    self.device.streams, self.device.handles
                ),
            });
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".to_string(),
                message: format!(
                    "value '{}' is invalid, expected one of: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        Ok(())
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}
