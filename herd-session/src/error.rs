//! Session error types

use herd_core::HerdError;
use thiserror::Error;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// The host could not be reached or authenticated
    #[error("Connection to {host} failed: {message}")]
    ConnectionFailed { host: String, message: String },

    /// A local helper process could not be started
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Upload or download failed
    #[error("Transfer from {from} to {to} failed: {message}")]
    Transfer {
        from: String,
        to: String,
        message: String,
    },

    /// A tunnel could not be established
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Unexpected output of a query command
    #[error("Unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the failure is about reaching the host at all
    pub fn is_connection_error(&self) -> bool {
        matches!(self, SessionError::ConnectionFailed { .. })
    }
}

impl From<SessionError> for HerdError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Io(e) => HerdError::Io(e),
            other => HerdError::Session(other.to_string()),
        }
    }
}
