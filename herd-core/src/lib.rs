//! Core types for herd
//!
//! This crate holds the pieces shared by every other herd crate:
//! - The coordination error taxonomy
//! - Process keys for tasks and tunnels
//! - Port candidate handling and local port probes
//! - Timestamps used to name execution logs

pub mod error;
pub mod ports;
pub mod process;
pub mod time;

// Re-export commonly used types
pub use error::{HerdError, HerdResult, PortScope, TaskExecutionError};
pub use ports::{local_port_is_free, remaining_ports, PortCandidates, PortRange};
pub use process::{ProcessKey, ProcessKind, KEY_DELIMITER};
pub use time::Timestamp;

/// Host name of the control node
pub const LOCALHOST: &str = "localhost";

/// Name of the environment variable that always points at a runtime's working directory
pub const WORKING_DIR_ENV_VAR_NAME: &str = "WORKING_DIR";
