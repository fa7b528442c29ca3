//! The session contract between the coordination layer and a host

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::error::{SessionError, SessionResult};

/// Result of a command run through a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout without trailing line breaks
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim_end_matches(['\n', '\r'])
    }

    /// Stdout followed by stderr, as shown in error reports
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Direction and ports of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelSpec {
    /// `local_port` on the control node becomes reachable as `runtime_port` on the host
    ToRuntime { local_port: u16, runtime_port: u16 },
    /// `runtime_port` on the host becomes reachable as `local_port` on the control node
    FromRuntime { runtime_port: u16, local_port: u16 },
}

impl TunnelSpec {
    /// Port that starts accepting connections once the tunnel is up
    pub fn listen_port(&self) -> u16 {
        match self {
            TunnelSpec::ToRuntime { runtime_port, .. } => *runtime_port,
            TunnelSpec::FromRuntime { local_port, .. } => *local_port,
        }
    }

    /// Port the tunnel forwards to
    pub fn target_port(&self) -> u16 {
        match self {
            TunnelSpec::ToRuntime { local_port, .. } => *local_port,
            TunnelSpec::FromRuntime { runtime_port, .. } => *runtime_port,
        }
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelSpec::ToRuntime {
                local_port,
                runtime_port,
            } => write!(f, "localhost:{} -> runtime:{}", local_port, runtime_port),
            TunnelSpec::FromRuntime {
                runtime_port,
                local_port,
            } => write!(f, "runtime:{} -> localhost:{}", runtime_port, local_port),
        }
    }
}

/// A running tunnel
#[derive(Debug)]
pub enum Tunnel {
    /// Forwarding done by a child process (e.g. `ssh -N`)
    Process(Child),
    /// Forwarding done by an in-process relay task
    Relay(JoinHandle<()>),
}

/// Stateful handle to one host.
///
/// Command and transfer failures of the channel itself are errors; a command
/// that runs and exits non-zero is reported through [`CommandOutput`].
#[async_trait]
pub trait RemoteSession: Send + Sync + fmt::Debug {
    /// Host identifier of this session
    fn host(&self) -> &str;

    /// Verify the host is reachable
    async fn connect(&self) -> SessionResult<()> {
        let output = self.run("true", None, &BTreeMap::new()).await?;
        if output.success() {
            Ok(())
        } else {
            Err(SessionError::ConnectionFailed {
                host: self.host().to_string(),
                message: output.combined(),
            })
        }
    }

    /// Run a shell command, optionally inside `cwd` and with extra environment variables
    async fn run(
        &self,
        command: &str,
        cwd: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> SessionResult<CommandOutput>;

    /// Copy a local file to the host
    async fn upload(&self, local_path: &Path, remote_path: &str) -> SessionResult<()>;

    /// Copy a file from the host
    async fn download(&self, remote_path: &str, local_path: &Path) -> SessionResult<()>;

    /// Release the underlying connection
    async fn close(&self) -> SessionResult<()>;

    /// Whether nothing accepts connections on `port` of the host
    async fn is_port_free(&self, port: u16) -> SessionResult<bool> {
        let probe = format!(
            "bash -c 'exec 3<>/dev/tcp/127.0.0.1/{}' >/dev/null 2>&1 && echo used || echo free",
            port
        );
        let output = self.run(&probe, None, &BTreeMap::new()).await?;
        match output.stdout_trimmed() {
            "free" => Ok(true),
            "used" => Ok(false),
            other => Err(SessionError::UnexpectedOutput {
                command: probe.clone(),
                output: other.to_string(),
            }),
        }
    }

    /// Start forwarding traffic between the control node and the host
    async fn open_tunnel(&self, spec: TunnelSpec) -> SessionResult<Tunnel>;
}

/// Quote `value` for POSIX shells
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the script that runs `command` in `cwd` with `env` exported
pub fn compose_script(command: &str, cwd: Option<&str>, env: &BTreeMap<String, String>) -> String {
    let mut script = String::new();
    for (key, value) in env {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    if let Some(dir) = cwd {
        script.push_str(&format!("cd {} || exit 1\n", shell_quote(dir)));
    }
    script.push_str(command);
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/dir"), "/tmp/dir");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_compose_script() {
        let mut env = BTreeMap::new();
        env.insert("WORKING_DIR".to_string(), "/tmp/w d".to_string());
        let script = compose_script("echo hi", Some("/tmp/w d"), &env);
        assert_eq!(
            script,
            "export WORKING_DIR='/tmp/w d'\ncd '/tmp/w d' || exit 1\necho hi"
        );
    }

    #[test]
    fn test_combined_output() {
        assert_eq!(CommandOutput::new("out\n", "", 0).combined(), "out\n");
        assert_eq!(CommandOutput::new("", "err", 1).combined(), "err");
        assert_eq!(CommandOutput::new("out\n", "err", 1).combined(), "out\nerr");
        assert_eq!(CommandOutput::new("a\r\n", "", 0).stdout_trimmed(), "a");
    }

    #[test]
    fn test_tunnel_ports() {
        let to = TunnelSpec::ToRuntime {
            local_port: 1,
            runtime_port: 2,
        };
        assert_eq!((to.listen_port(), to.target_port()), (2, 1));
        let from = TunnelSpec::FromRuntime {
            runtime_port: 2,
            local_port: 1,
        };
        assert_eq!((from.listen_port(), from.target_port()), (1, 2));
    }
}
