//! Application configuration.
//!
//! Wraps the broker configuration in a single Config struct that can be
//! loaded from YAML files or environment variables.

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "switchyard.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SWITCHYARD_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SWITCHYARD";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SWITCHYARD_LOG";
/// Environment variable listing the events a worker process serves.
pub const WORKER_EVENTS_ENV_VAR: &str = "SWITCHYARD_WORKER_EVENTS";

use serde::Deserialize;

use crate::bus::{BrokerConfig, BrokerError};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker configuration.
    pub broker: BrokerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `switchyard.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `SWITCHYARD_CONFIG` environment variable (if set)
    /// 4. Environment variables with `SWITCHYARD__` prefix, `__` between levels
    ///    (e.g. `SWITCHYARD__BROKER__REDIS__URL`)
    pub fn load(path: Option<&str>) -> Result<Self, BrokerError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize::<Config>())
            .map_err(|e| BrokerError::Config(e.to_string()))?;

        Ok(config)
    }
}
