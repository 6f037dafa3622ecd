//! Configuration Loader
//!
//! Environment-aware loading: built-in defaults, an optional base TOML file, an
//! optional per-environment TOML file, and `ORDER_STATUS__*` environment variables,
//! merged in that order by the `config` crate.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::PipelineConfig;

/// Base name of the configuration files (`order-status.toml`, `order-status.{env}.toml`)
const CONFIG_FILE_STEM: &str = "order-status";
/// Prefix for environment overrides, e.g. `ORDER_STATUS__BROKER__HOST`
const ENV_PREFIX: &str = "ORDER_STATUS";
const ENV_SEPARATOR: &str = "__";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: PipelineConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = env::var("ORDER_STATUS_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"));
        Self::load_from_directory(&config_directory)
    }

    /// Load configuration from a specific directory, reading overrides from the
    /// process environment
    pub fn load_from_directory(config_directory: &Path) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_overrides(config_directory, &detect_environment(), None)
    }

    /// Load configuration with an explicit environment name and override map
    ///
    /// When `env_overrides` is `Some`, it replaces the process environment as the
    /// source of `ORDER_STATUS__*` variables, so tests never touch global state.
    pub fn load_with_overrides(
        config_directory: &Path,
        environment: &str,
        env_overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let defaults = PipelineConfig {
            environment: environment.to_string(),
            ..PipelineConfig::default()
        };

        let base_file = config_directory.join(format!("{CONFIG_FILE_STEM}.toml"));
        let env_file = config_directory.join(format!("{CONFIG_FILE_STEM}.{environment}.toml"));

        let merged = Config::builder()
            .add_source(
                Config::try_from(&defaults)
                    .map_err(|e| ConfigurationError::source_error("defaults", e))?,
            )
            .add_source(File::from(base_file).format(FileFormat::Toml).required(false))
            .add_source(File::from(env_file).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true)
                    .source(env_overrides),
            )
            .build()?;

        let mut config: PipelineConfig = merged
            .try_deserialize()
            .map_err(ConfigurationError::deserialization_error)?;
        // The detected environment wins over anything a file claims
        config.environment = environment.to_string();

        config.validate()?;

        info!(
            environment = %environment,
            broker = %config.broker.redacted_url(),
            prefetch = config.consumer.prefetch_count,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: config_directory.to_path_buf(),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Configuration as JSON with credentials masked, safe for logs
    pub fn debug_config(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null);
        sanitize_json(&mut value);
        value
    }
}

/// Environment name from `ORDER_STATUS_ENV`, then `APP_ENV`, default `development`
pub fn detect_environment() -> String {
    env::var("ORDER_STATUS_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
        .to_lowercase()
}

fn sanitize_json(value: &mut serde_json::Value) {
    const SENSITIVE: [&str; 3] = ["password", "secret", "url"];

    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                if SENSITIVE.iter().any(|pattern| key_lower.contains(pattern)) {
                    if let serde_json::Value::String(s) = val {
                        if !s.is_empty() {
                            *val = serde_json::Value::String("***REDACTED***".to_string());
                        }
                    }
                } else {
                    sanitize_json(val);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(sanitize_json),
        _ => {}
    }
}
