//! Configuration loading and environment variable handling

use crate::domains::HerdConfig;
use crate::error::{ConfigError, ConfigResult};
use log::debug;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "HERD".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<HerdConfig> {
        debug!("Loading configuration from {}", path.as_ref().display());
        let content = std::fs::read_to_string(path)?;
        self.from_yaml_str(&content)
    }

    /// Load configuration from YAML text with environment overrides
    pub fn from_yaml_str(&self, content: &str) -> ConfigResult<HerdConfig> {
        let mut config: HerdConfig = if content.trim().is_empty() {
            HerdConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<HerdConfig> {
        let mut config = HerdConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<HerdConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut HerdConfig) -> ConfigResult<()> {
        if let Ok(level) = self.get_env_var("LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(dir) = self.get_env_var("LOG_DIRECTORY") {
            config.logging.log_directory = PathBuf::from(dir);
        }

        if let Ok(timeout) = self.get_env_var("MASTER_START_TIMEOUT") {
            let seconds: u64 = self.parse_env("MASTER_START_TIMEOUT", &timeout)?;
            config.cluster.master_start_timeout = Duration::from_secs(seconds);
        }

        if let Ok(port) = self.get_env_var("DEFAULT_MASTER_PORT") {
            config.ports.default_master_port = self.parse_env("DEFAULT_MASTER_PORT", &port)?;
        }

        if let Ok(port) = self.get_env_var("SSH_PORT") {
            config.runtime.ssh.port = self.parse_env("SSH_PORT", &port)?;
        }

        if let Ok(user) = self.get_env_var("SSH_USER") {
            config.runtime.ssh.user = Some(user);
        }

        Ok(())
    }

    fn parse_env<T>(&self, name: &str, value: &str) -> ConfigResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        value.trim().parse().map_err(|e| {
            ConfigError::EnvError(format!("Invalid {}_{}: {}", self.prefix, name, e))
        })
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
