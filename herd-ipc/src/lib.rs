//! Remote job protocol for herd
//!
//! Function steps do not ship code. The control node writes a versioned
//! request envelope naming a pre-deployed entry point, the remote host runs
//! a job runner binary that dispatches to that entry point, and the runner
//! writes a response envelope that is transferred back and decoded.

pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use error::{IpcError, IpcResult};
pub use protocol::{JobEnvelope, JobOutcome, JobRequest, JobResponse, JOB_PROTOCOL_VERSION};
pub use registry::JobRegistry;
pub use transport::{FileTransport, JobTransport};
