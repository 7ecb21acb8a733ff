//! Configuration Loader
//!
//! Environment-aware configuration loading. Handles environment detection, file
//! discovery and merging through the `config` crate.

use super::error::ConfigResult;
use super::ArgusConfig;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Base file every environment starts from
const BASE_CONFIG_FILE: &str = "argus.toml";
const ENV_PREFIX: &str = "ARGUS";
const ENV_SEPARATOR: &str = "__";

pub struct ConfigManager {
    config: ArgusConfig,
    environment: String,
    config_directory: PathBuf,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("environment", &self.environment)
            .field("config_directory", &self.config_directory)
            .finish()
    }
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = environment,
            bus_provider = ?config.bus.provider,
            topic = %config.bus.topic,
            partitions = config.bus.partitions,
            "✅ Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    pub fn config(&self) -> &ArgusConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// `ARGUS_ENV`, then `APP_ENV`, then `development`.
    pub fn detect_environment() -> String {
        env::var("ARGUS_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("ARGUS_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(config_directory: &Path, environment: &str) -> ConfigResult<ArgusConfig> {
        let base_path = config_directory.join(BASE_CONFIG_FILE);
        let env_path = config_directory.join(format!("{environment}.toml"));

        debug!(
            base = %base_path.display(),
            base_exists = base_path.exists(),
            overrides = %env_path.display(),
            overrides_exist = env_path.exists(),
            "Resolving configuration sources"
        );

        let settings = config::Config::builder()
            .add_source(config::File::from(base_path).required(false))
            .add_source(config::File::from(env_path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .set_override("environment", environment)?
            .build()?;

        Ok(settings.try_deserialize::<ArgusConfig>()?)
    }
}
