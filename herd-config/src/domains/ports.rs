//! Port allocation defaults

use crate::error::ConfigResult;
use crate::validation::{validate_port_range, validate_positive, Validatable};
use herd_core::PortRange;
use serde::{Deserialize, Serialize};

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Local ports used when a runtime port is forwarded to the whole group
    #[serde(default = "default_group_port_range")]
    pub group_port_range: PortRange,

    /// Candidate ports for cluster masters and workers
    #[serde(default = "default_cluster_port_range")]
    pub cluster_port_range: PortRange,

    /// Port tried first for a cluster master
    #[serde(default = "default_master_port")]
    pub default_master_port: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            group_port_range: default_group_port_range(),
            cluster_port_range: default_cluster_port_range(),
            default_master_port: default_master_port(),
        }
    }
}

impl Validatable for PortsConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_port_range(&self.group_port_range, "group_port_range", self.domain_name())?;
        validate_port_range(
            &self.cluster_port_range,
            "cluster_port_range",
            self.domain_name(),
        )?;
        validate_positive(
            self.default_master_port,
            "default_master_port",
            self.domain_name(),
        )
    }

    fn domain_name(&self) -> &'static str {
        "ports"
    }
}

fn default_group_port_range() -> PortRange {
    PortRange::new(5800, 5999)
}

fn default_cluster_port_range() -> PortRange {
    PortRange::new(60001, 60200)
}

fn default_master_port() -> u16 {
    60000
}
