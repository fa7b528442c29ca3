//! Error taxonomy for herd coordination

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for coordination operations
pub type HerdResult<T> = std::result::Result<T, HerdError>;

/// Where a port conflict was observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortScope {
    /// A single runtime host
    Runtime(String),
    /// Every checked member of a runtime group
    Group,
    /// The control node
    Local,
}

impl fmt::Display for PortScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortScope::Runtime(host) => write!(f, "runtime {}", host),
            PortScope::Group => write!(f, "runtime group"),
            PortScope::Local => write!(f, "localhost"),
        }
    }
}

/// A failed step of a runtime task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExecutionError {
    pub task_name: String,
    pub step_index: usize,
    pub host: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
    pub cause: Option<String>,
}

impl TaskExecutionError {
    pub fn new(
        task_name: impl Into<String>,
        step_index: usize,
        host: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            step_index,
            host: host.into(),
            output: output.into(),
            log_file: None,
            cause: None,
        }
    }

    pub fn with_log_file(mut self, log_file: Option<PathBuf>) -> Self {
        self.log_file = log_file;
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl fmt::Display for TaskExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "An error occurred during the execution of RuntimeTask {} on host {} in task step {}.",
            self.task_name, self.host, self.step_index
        )?;
        if let Some(path) = &self.log_file {
            write!(
                f,
                " Please check the respective execution log file `{}`.",
                path.display()
            )?;
        }
        write!(f, " The output on the Runtime was:\n {}", self.output)?;
        if let Some(cause) = &self.cause {
            write!(f, " Predecessor Exception: {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskExecutionError {}

/// Core error type for all herd coordination errors
#[derive(Debug, Error)]
pub enum HerdError {
    /// The session to a host could not be validated
    #[error("No runtime could be instantiated for host: {host}. Predecessor Exception: {cause}")]
    InvalidRuntime { host: String, cause: String },

    /// A task step failed
    #[error("{0}")]
    TaskExecution(#[from] TaskExecutionError),

    /// A specifically requested port is occupied
    #[error("The port {port} is already in use on {scope}")]
    PortInUse { port: u16, scope: PortScope },

    /// A candidate port list was exhausted
    #[error("No free port could be determined. No more ports left in port list.")]
    NoPortsLeft,

    /// Group or manager construction found nothing usable
    #[error("No runtimes detected: {0}")]
    NoRuntimesDetected(String),

    /// A remote directory could not be created
    #[error("The path {path} could not be created on host {host}")]
    PathCreation { path: String, host: String },

    /// The cluster master did not become ready
    #[error("Master could not be started on {host} using port {port}. Predecessor Exception: {cause}")]
    MasterStart { host: String, port: u16, cause: String },

    /// The cluster state machine refused a transition
    #[error("Invalid cluster state: expected {expected}, found {actual}")]
    InvalidClusterState { expected: String, actual: String },

    /// A host is not part of the group
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    /// A process key is not registered with the runtime
    #[error("Unknown process key: {0}")]
    UnknownProcess(String),

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Remote session failure
    #[error("Session error: {0}")]
    Session(String),

    /// Remote job payload failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HerdError {
    /// Whether the error stems from exhausted or occupied ports
    pub fn is_port_exhaustion(&self) -> bool {
        matches!(self, HerdError::NoPortsLeft | HerdError::PortInUse { .. })
    }

    /// Whether repeating the operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HerdError::PortInUse { .. } | HerdError::Session(_) | HerdError::Io(_)
        )
    }

    /// The failed task step, if this is a task error
    pub fn as_task_error(&self) -> Option<&TaskExecutionError> {
        match self {
            HerdError::TaskExecution(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HerdError {
    fn from(err: serde_json::Error) -> Self {
        HerdError::Serialization(err.to_string())
    }
}
