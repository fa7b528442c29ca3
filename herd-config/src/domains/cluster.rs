//! Cluster bootstrap configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::utils::{serde_duration, serde_duration_millis};

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Wall-clock bound on the master readiness poll
    #[serde(default = "default_master_start_timeout", with = "serde_duration")]
    pub master_start_timeout: Duration,

    /// First delay between readiness probes
    #[serde(default = "default_poll_initial_delay", with = "serde_duration_millis")]
    pub poll_initial_delay: Duration,

    /// Upper bound of the delay between readiness probes
    #[serde(default = "default_poll_max_delay", with = "serde_duration_millis")]
    pub poll_max_delay: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            master_start_timeout: default_master_start_timeout(),
            poll_initial_delay: default_poll_initial_delay(),
            poll_max_delay: default_poll_max_delay(),
        }
    }
}

impl Validatable for ClusterConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(
            self.master_start_timeout.as_millis(),
            "master_start_timeout",
            self.domain_name(),
        )?;
        validate_positive(
            self.poll_initial_delay.as_millis(),
            "poll_initial_delay",
            self.domain_name(),
        )?;
        if self.poll_max_delay < self.poll_initial_delay {
            return Err(self.validation_error(
                "poll_max_delay must not be smaller than poll_initial_delay",
            ));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "cluster"
    }
}

fn default_master_start_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_poll_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_poll_max_delay() -> Duration {
    Duration::from_millis(1000)
}
