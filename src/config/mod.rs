//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod storage;

pub use storage::StorageConfig;

use serde::Deserialize;

use crate::storage::{BackendConfig, Dialect};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "UNISTORE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "UNISTORE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "UNISTORE_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database connection.
    pub storage: StorageConfig,
    /// Write path, watch and background loop settings.
    pub backend: BackendConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` between levels
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document on top of the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the backend cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Dialect::from_url(&self.storage.database_url)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let backend = &self.backend;
        if backend.watch_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "backend.watch_buffer_size must be positive".to_string(),
            ));
        }
        if backend.pruner.enabled && backend.pruner.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "backend.pruner.history_limit must be positive".to_string(),
            ));
        }
        if backend.pruner.max_wait_ms < backend.pruner.min_wait_ms {
            return Err(ConfigError::Invalid(
                "backend.pruner.max_wait_ms must not be below min_wait_ms".to_string(),
            ));
        }
        if backend.gc.enabled && backend.gc.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "backend.gc.batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
