//! Runtime and ssh session configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::utils::{default_false, serde_duration, serde_duration_millis};

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Environment variable that carries the working directory
    #[serde(default = "default_working_dir_env_var")]
    pub working_dir_env_var: String,

    /// Command that must succeed for a host to count as a valid runtime
    #[serde(default = "default_validation_command")]
    pub validation_command: String,

    /// Pause after opening a tunnel before it is used
    #[serde(
        default = "default_tunnel_settle_delay",
        with = "serde_duration_millis"
    )]
    pub tunnel_settle_delay: Duration,

    /// Grace period between terminate and kill when stopping a process
    #[serde(default = "default_stop_grace_period", with = "serde_duration_millis")]
    pub stop_grace_period: Duration,

    /// SSH options for hosts reached through ssh
    #[serde(default)]
    pub ssh: SshConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            working_dir_env_var: default_working_dir_env_var(),
            validation_command: default_validation_command(),
            tunnel_settle_delay: default_tunnel_settle_delay(),
            stop_grace_period: default_stop_grace_period(),
            ssh: SshConfig::default(),
        }
    }
}

impl Validatable for RuntimeConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(
            &self.working_dir_env_var,
            "working_dir_env_var",
            self.domain_name(),
        )?;
        validate_required_string(
            &self.validation_command,
            "validation_command",
            self.domain_name(),
        )?;
        self.ssh.validate()
    }

    fn domain_name(&self) -> &'static str {
        "runtime"
    }
}

/// Options used to build ssh and scp invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Login user; the ssh default applies when unset
    pub user: Option<String>,

    pub identity_file: Option<PathBuf>,

    #[serde(default = "default_connect_timeout", with = "serde_duration")]
    pub connect_timeout: Duration,

    #[serde(default = "default_false")]
    pub strict_host_key_checking: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            user: None,
            identity_file: None,
            connect_timeout: default_connect_timeout(),
            strict_host_key_checking: false,
        }
    }
}

impl Validatable for SshConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.port, "port", self.domain_name())?;
        validate_positive(
            self.connect_timeout.as_secs(),
            "connect_timeout",
            self.domain_name(),
        )
    }

    fn domain_name(&self) -> &'static str {
        "ssh"
    }
}

fn default_working_dir_env_var() -> String {
    herd_core::WORKING_DIR_ENV_VAR_NAME.to_string()
}

fn default_validation_command() -> String {
    "echo herd".to_string()
}

fn default_tunnel_settle_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_stop_grace_period() -> Duration {
    Duration::from_millis(500)
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
