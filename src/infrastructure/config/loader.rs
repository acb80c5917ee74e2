use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration error types. All of these are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Registration name cannot be empty")]
    EmptyRegistration,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Signing is enabled but no signing_key_path is configured")]
    MissingSigningKey,

    #[error("Kubernetes scheduling requires a deployment name (config or ATOMIST_DEPLOYMENT_NAME)")]
    MissingDeploymentName,

    #[error("Invalid progress flush_bytes: {0}. Must be at least 1")]
    InvalidFlushBytes(usize),

    #[error("Invalid cleanup interval: {0}. Must be at least 60 seconds")]
    InvalidCleanupInterval(u64),
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .stevedore/config.yaml (project config)
    /// 3. .stevedore/local.yaml (local overrides, optional)
    /// 4. Environment variables (STEVEDORE_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".stevedore/config.yaml"))
            .merge(Yaml::file(".stevedore/local.yaml"))
            .merge(Env::prefixed("STEVEDORE_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("STEVEDORE_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.registration.trim().is_empty() {
            return Err(ConfigError::EmptyRegistration);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.signing.enabled && config.signing.signing_key_path.is_none() {
            return Err(ConfigError::MissingSigningKey);
        }

        if config.scheduling.mode == crate::domain::models::SchedulerMode::Kubernetes
            && config.kubernetes.deployment_name.is_none()
            && std::env::var(crate::services::scheduler::DEPLOYMENT_NAME_ENV).is_err()
        {
            return Err(ConfigError::MissingDeploymentName);
        }

        if config.progress.flush_bytes == 0 {
            return Err(ConfigError::InvalidFlushBytes(config.progress.flush_bytes));
        }

        if config.kubernetes.cleanup_interval_secs < 60 {
            return Err(ConfigError::InvalidCleanupInterval(
                config.kubernetes.cleanup_interval_secs,
            ));
        }

        Ok(())
    }
}
