//! Logging infrastructure for herd
//!
//! Two concerns live here:
//! - Installing the global `tracing` subscriber used for diagnostics
//! - Execution log files that persist the output of every task step

pub mod execution_log;
pub mod init;

// Re-export main types for convenience
pub use execution_log::ExecutionLogFile;
pub use init::{init_logging_from_config, init_simple_tracing};
