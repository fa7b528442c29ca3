//! Process keys for task and tunnel processes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the components of a process key
pub const KEY_DELIMITER: &str = "::";

const TASK_MARKER: &str = "task";
const LOCAL_FORWARD_MARKER: &str = "-L";
const REMOTE_FORWARD_MARKER: &str = "-R";

/// Kind of a background process owned by a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Task,
    Tunnel,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::Task => write!(f, "task"),
            ProcessKind::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// Registry key of a background process.
///
/// Keys encode the owning host and the process kind:
/// - `host::task::<task name>::<sequence>`
/// - `host::-R::<runtime port>::<local port>` (local port exposed to the runtime)
/// - `host::-L::<local port>::<runtime port>` (runtime port exposed locally)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessKey(String);

impl ProcessKey {
    pub fn task(host: &str, task_name: &str, sequence: u64) -> Self {
        Self(
            [host, TASK_MARKER, task_name, &sequence.to_string()].join(KEY_DELIMITER),
        )
    }

    /// Key of a tunnel that makes `local_port` reachable as `runtime_port` on the host
    pub fn to_runtime(host: &str, runtime_port: u16, local_port: u16) -> Self {
        Self(
            [
                host,
                REMOTE_FORWARD_MARKER,
                &runtime_port.to_string(),
                &local_port.to_string(),
            ]
            .join(KEY_DELIMITER),
        )
    }

    /// Key of a tunnel that makes `runtime_port` of the host reachable as `local_port`
    pub fn from_runtime(host: &str, local_port: u16, runtime_port: u16) -> Self {
        Self(
            [
                host,
                LOCAL_FORWARD_MARKER,
                &local_port.to_string(),
                &runtime_port.to_string(),
            ]
            .join(KEY_DELIMITER),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn host(&self) -> &str {
        self.0.split(KEY_DELIMITER).next().unwrap_or_default()
    }

    pub fn kind(&self) -> Option<ProcessKind> {
        match self.0.split(KEY_DELIMITER).nth(1) {
            Some(TASK_MARKER) => Some(ProcessKind::Task),
            Some(LOCAL_FORWARD_MARKER) | Some(REMOTE_FORWARD_MARKER) => Some(ProcessKind::Tunnel),
            _ => None,
        }
    }

    pub fn is_task(&self) -> bool {
        self.kind() == Some(ProcessKind::Task)
    }

    pub fn is_tunnel(&self) -> bool {
        self.kind() == Some(ProcessKind::Tunnel)
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProcessKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ProcessKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_key() {
        let key = ProcessKey::task("node-1", "train", 3);
        assert_eq!(key.as_str(), "node-1::task::train::3");
        assert_eq!(key.host(), "node-1");
        assert!(key.is_task());
        assert!(!key.is_tunnel());
    }

    #[test]
    fn test_tunnel_keys() {
        let to = ProcessKey::to_runtime("node-2", 8786, 60000);
        assert_eq!(to.as_str(), "node-2::-R::8786::60000");
        assert_eq!(to.kind(), Some(ProcessKind::Tunnel));

        let from = ProcessKey::from_runtime("node-2", 5800, 9000);
        assert_eq!(from.as_str(), "node-2::-L::5800::9000");
        assert!(from.is_tunnel());
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(ProcessKey::from("just-a-host").kind(), None);
    }
}
