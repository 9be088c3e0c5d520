//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use quotad::AllocOptions;
use quotad::io::DEFAULT_MAX_DEPTH;

fn default_storage_root() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("/var/lib/quotad/storage"),
        |dir| dir.join("quotad").join("storage"),
    )
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

/// The allocation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AllocationConfig {
    /// Capacity of the top-level allocation. Zero disables allocations.
    #[serde(default)]
    pub size: ByteSize,

    /// How often the serve loop publishes accounting state to other processes.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Deepest directory nesting a tree walk descends into.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            size: ByteSize::b(0),
            flush_interval_secs: default_flush_interval_secs(),
            max_depth: default_max_depth(),
        }
    }
}

impl AllocationConfig {
    /// The flush cadence as a [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Library options derived from this configuration.
    pub fn options(&self) -> AllocOptions {
        AllocOptions {
            max_depth: self.max_depth,
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The host directory exported to clients.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    #[serde(default)]
    pub allocation: AllocationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            allocation: AllocationConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing every validation error message.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.storage_root.is_absolute() {
            errors.push(format!(
                "Storage root '{}' must be an absolute path.",
                self.storage_root.display()
            ));
        }

        if self.allocation.flush_interval_secs == 0 {
            errors.push("Allocation flush interval must be at least one second.".to_owned());
        }

        if self.allocation.max_depth == 0 {
            errors.push("Allocation max depth must be at least 1.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("quotad").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("quotad").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/quotad/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config, falling back to defaults when no file exists.
    /// Errors if a config file exists but is malformed or invalid.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(res) = Self::load(external_config_path) else {
            debug!("No configuration file found; using defaults.");
            return Ok(Self::default());
        };

        let config = res?;
        if let Err(validation_errors) = config.validate() {
            return Err(ConfigError::ValidationErrors(validation_errors));
        }
        debug!("Loaded configuration successfully.");
        Ok(config)
    }
}
