//! Configuration loader with hierarchical merging.

use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;

use crate::domain::errors::ConfigError;
use crate::domain::models::config::Config;

use super::overlay::merge_overlays;

/// Loads and validates the process configuration.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.devloop/config.yaml` (project config)
    /// 3. `.devloop/local.yaml` (local overrides, optional)
    /// 4. Environment variables (`DEVLOOP_*` prefix)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".devloop/config.yaml"))
            .merge(Yaml::file(".devloop/local.yaml"))
            .merge(Env::prefixed("DEVLOOP_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Resolve the PRD overlay chain on top of a base config. `layers` are
    /// YAML documents in merge order (project → framework → PRD-set → PRD →
    /// phase); missing files should simply be omitted by the caller.
    pub fn resolve_overlays(base: &Config, layers: &[serde_yaml::Value]) -> Result<Config> {
        let mut json_layers = vec![serde_json::to_value(base).context("serialize base config")?];
        for layer in layers {
            let as_json: serde_json::Value =
                serde_json::to_value(layer).context("convert overlay layer")?;
            json_layers.push(as_json);
        }
        let merged = merge_overlays(&json_layers);
        let config: Config =
            serde_json::from_value(merged).context("deserialize merged overlay config")?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(config.max_retries));
        }

        if config.task_master.tasks_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyTasksPath);
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.monitor.polling_interval == 0 {
            return Err(ConfigError::InvalidPollingInterval(
                config.monitor.polling_interval,
            ));
        }

        Ok(())
    }
}
