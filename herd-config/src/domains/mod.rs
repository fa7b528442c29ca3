//! Domain-specific configuration modules

pub mod cluster;
pub mod logging;
pub mod ports;
pub mod runtime;
pub mod utils;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main herd configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HerdConfig {
    #[serde(default)]
    pub logging: logging::LoggingConfig,

    #[serde(default)]
    pub runtime: runtime::RuntimeConfig,

    #[serde(default)]
    pub ports: ports::PortsConfig,

    #[serde(default)]
    pub cluster: cluster::ClusterConfig,
}

impl HerdConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.logging.validate()?;
        self.runtime.validate()?;
        self.ports.validate()?;
        self.cluster.validate()?;
        Ok(())
    }
}
