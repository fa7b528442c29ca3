//! Remote session collaborators for herd
//!
//! The coordination layer only talks to hosts through [`RemoteSession`].
//! This crate provides:
//! - [`SshSession`]: `ssh`/`scp` child processes with a shared control connection
//! - [`LocalSession`]: the control node itself, with in-process port relays
//! - [`HostFacts`] and [`HostFilter`]: read-only host queries
//! - `MockSession` (feature `testing`): scripted sessions for unit tests

pub mod error;
pub mod facts;
pub mod local;
pub mod relay;
pub mod session;
pub mod ssh;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

// Re-export main types
pub use error::{SessionError, SessionResult};
pub use facts::{HostFacts, HostFilter};
pub use local::LocalSession;
pub use session::{compose_script, shell_quote, CommandOutput, RemoteSession, Tunnel, TunnelSpec};
pub use ssh::SshSession;

#[cfg(any(test, feature = "testing"))]
pub use mock::MockSession;
