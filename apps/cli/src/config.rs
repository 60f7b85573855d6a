//! CLI configuration file support.
//!
//! Configuration precedence:
//! 1. CLI arguments (handled by clap)
//! 2. Environment variables (`RUST_LOG`)
//! 3. Local config file (./.spindlerc)
//! 4. Global config file (~/.spindle/config.toml)
//! 5. Defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// CLI configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Log level or filter directive
    #[serde(default)]
    pub log_level: Option<String>,

    /// Executor count used when `--cluster_size` is not given
    #[serde(default)]
    pub cluster_size: Option<u32>,
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum CliConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),
}

pub type CliConfigResult<T> = std::result::Result<T, CliConfigError>;

impl CliConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> CliConfigResult<Self> {
        if !path.exists() {
            return Err(CliConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| CliConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content).map_err(|e| CliConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    pub fn default_global_path() -> PathBuf {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".spindle").join("config.toml")
    }

    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".spindlerc")
    }

    /// Global config, overridden by local config. Missing or unreadable
    /// files are skipped.
    pub fn discover_and_load() -> Self {
        let mut config = Self::default();

        if let Ok(global_config) = Self::load_from_file(&Self::default_global_path()) {
            config.merge(&global_config);
        }
        if let Ok(local_config) = Self::load_from_file(&Self::default_local_path()) {
            config.merge(&local_config);
        }

        config
    }

    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &Self) {
        if let Some(ref log_level) = other.log_level {
            self.log_level = Some(log_level.clone());
        }
        if let Some(cluster_size) = other.cluster_size {
            self.cluster_size = Some(cluster_size);
        }
    }
}

/// An explicit `--config` file must load; otherwise discover the defaults.
pub fn load_config(explicit: Option<&Path>) -> CliConfigResult<CliConfig> {
    match explicit {
        Some(path) => CliConfig::load_from_file(path),
        None => Ok(CliConfig::discover_and_load()),
    }
}
