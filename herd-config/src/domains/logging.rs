//! Logging configuration

use crate::error::ConfigResult;
use crate::validation::{validate_enum_choice, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::utils::default_true;

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level passed to the tracing env filter
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Main directory; execution logs go to `<log_directory>/execution_log`
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,

    /// Persist step output of tasks that do not stream locally
    #[serde(default = "default_true")]
    pub file_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_directory: default_log_directory(),
            file_logging: true,
        }
    }
}

impl LoggingConfig {
    /// Directory holding one sub-directory of task logs per host
    pub fn execution_log_directory(&self) -> PathBuf {
        self.log_directory.join("execution_log")
    }
}

impl Validatable for LoggingConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_enum_choice(&self.level, &LOG_LEVELS, "level", self.domain_name())?;
        if self.log_directory.as_os_str().is_empty() {
            return Err(self.validation_error("log_directory cannot be empty"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "logging"
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("./herd")
}
