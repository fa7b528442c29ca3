//! Resilience helpers for herd
//!
//! - Backoff calculation between repeated probes
//! - Bounded readiness polling for freshly started processes
//! - Escalating shutdown of child processes

pub mod backoff;
pub mod readiness;
pub mod shutdown;

// Re-export main types
pub use backoff::BackoffCalculator;
pub use readiness::{PollError, ProbeStatus, ReadinessPoll};
pub use shutdown::{ProcessShutdownManager, ShutdownError};
