//! Configuration types for cloudbd
//!
//! A device is described by [`DeviceConfig`]. Values are layered: built-in
//! defaults, then an optional TOML file, then `CLOUDBD_*` environment
//! variables (nested keys use `__`, e.g. `CLOUDBD_RETRY__BASE_DELAY_MS`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "CLOUDBD";

/// Device construction-time configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Name of the container backing the device
    pub container_name: String,
    /// Create the container and metadata when they are missing
    pub create: bool,
    /// Number of I/O workers
    pub workers: usize,
    /// Block size used when initializing a new device
    pub default_block_size: Option<u64>,
    /// Total size used when initializing a new device
    pub default_total_size: Option<u64>,
    /// Rate-limit retry settings
    pub retry: RetryConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            container_name: String::new(),
            create: false,
            workers: 8,
            default_block_size: None,
            default_total_size: None,
            retry: RetryConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Create a config for the named container with default settings
    pub fn new(container_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from defaults, an optional TOML file and the environment
    ///
    /// The result is not validated; callers may still override fields.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Reject settings the device cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.container_name.trim().is_empty() {
            return Err(Error::configuration("container_name is required"));
        }
        if self.workers == 0 {
            return Err(Error::configuration("workers must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::configuration("retry.max_attempts must be at least 1"));
        }
        if self.default_block_size == Some(0) {
            return Err(Error::configuration("default_block_size must be positive"));
        }
        Ok(())
    }
}

/// Backoff settings applied to rate-limited remote calls
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Base unit of the exponential backoff in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound (exclusive) of the uniform jitter in milliseconds
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            jitter_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Base backoff unit
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Jitter bound
    #[must_use]
    pub const fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}
