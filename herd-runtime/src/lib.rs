//! Remote task execution for herd
//!
//! - [`RuntimeTask`]: an ordered, named list of steps with an execution log
//! - [`Runtime`]: one host with its session, working directory and processes
//! - [`RuntimeGroup`]: several runtimes with group-wide port coordination
//! - [`RuntimeManager`]: probes candidate hosts and builds groups

pub mod group;
pub mod manager;
pub mod process;
pub mod runtime;
pub mod task;

// Re-export main types
pub use group::{Dispatched, RuntimeGroup, TaskTarget};
pub use manager::RuntimeManager;
pub use process::{ProcessBackend, ProcessHandle, ProcessRegistry};
pub use runtime::{ExecuteOptions, Runtime};
pub use task::{ExecutionContext, FunctionReturns, RemoteJob, RuntimeTask, Step, DEFAULT_JOB_RUNNER};
