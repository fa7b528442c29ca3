//! Configuration management for herd
//!
//! Configuration is an explicit value built once by the caller and passed
//! down into runtimes, groups and clusters. It is split into domains:
//! - Logging: level and execution log directory
//! - Runtime: working directory variable, validation probe, ssh options
//! - Ports: internal group range, cluster range, default master port
//! - Cluster: master start timeout and readiness polling

pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use domains::{
    cluster::ClusterConfig, logging::LoggingConfig, ports::PortsConfig,
    runtime::{RuntimeConfig, SshConfig},
    HerdConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;
