//! Session backed by the `ssh` and `scp` binaries

use async_trait::async_trait;
use herd_config::SshConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::session::{compose_script, shell_quote, CommandOutput, RemoteSession, Tunnel, TunnelSpec};

/// Exit code ssh uses for its own failures
const SSH_FAILURE_EXIT_CODE: i32 = 255;

/// Session that shells out to `ssh` and `scp`.
///
/// All invocations share one control connection, which `close` tears down.
#[derive(Debug, Clone)]
pub struct SshSession {
    host: String,
    config: SshConfig,
    control_path: PathBuf,
}

impl SshSession {
    pub fn new(host: impl Into<String>, config: SshConfig) -> Self {
        let host = host.into();
        let control_path = std::env::temp_dir().join(format!("herd-ssh-{}-%r@%h:%p", std::process::id()));
        Self {
            host,
            config,
            control_path,
        }
    }

    /// `user@host`, or just the host when no user is configured
    pub fn destination(&self) -> String {
        match &self.config.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Options shared by ssh and scp
    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                if self.config.strict_host_key_checking { "yes" } else { "no" }
            ),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "ControlPersist=60".to_string(),
        ];
        if let Some(key) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    /// Arguments for `ssh`, without the destination
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.config.port.to_string()];
        args.extend(self.common_options());
        args
    }

    /// Arguments for `scp`, without the paths; `recursive` for directory sources
    pub fn scp_args(&self, recursive: bool) -> Vec<String> {
        let mut args = vec!["-q".to_string(), "-P".to_string(), self.config.port.to_string()];
        if recursive {
            args.push("-r".to_string());
        }
        args.extend(self.common_options());
        args
    }

    /// Arguments that open `spec` as a background forward
    pub fn tunnel_args(&self, spec: TunnelSpec) -> Vec<String> {
        let forward = match spec {
            TunnelSpec::ToRuntime {
                local_port,
                runtime_port,
            } => vec!["-R".to_string(), format!("{}:localhost:{}", runtime_port, local_port)],
            TunnelSpec::FromRuntime {
                runtime_port,
                local_port,
            } => vec!["-L".to_string(), format!("{}:localhost:{}", local_port, runtime_port)],
        };

        let mut args = self.ssh_args();
        args.extend([
            "-N".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
        ]);
        args.extend(forward);
        args.push(self.destination());
        args
    }

    async fn scp(&self, from: String, to: String, recursive: bool) -> SessionResult<()> {
        let output = Command::new("scp")
            .args(self.scp_args(recursive))
            .arg(&from)
            .arg(&to)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SessionError::Spawn {
                program: "scp".to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(SessionError::Transfer {
                from,
                to,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(
        &self,
        command: &str,
        cwd: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> SessionResult<CommandOutput> {
        let script = compose_script(command, cwd, env);
        debug!("Running on {}: {}", self.host, command);

        let output = Command::new("ssh")
            .args(self.ssh_args())
            .arg(self.destination())
            .arg(&script)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SessionError::Spawn {
                program: "ssh".to_string(),
                source,
            })?;

        let output = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if output.exit_code == SSH_FAILURE_EXIT_CODE && output.stdout.is_empty() {
            return Err(SessionError::ConnectionFailed {
                host: self.host.clone(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> SessionResult<()> {
        let recursive = tokio::fs::metadata(local_path)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false);
        self.scp(
            local_path.display().to_string(),
            format!("{}:{}", self.destination(), remote_path),
            recursive,
        )
        .await
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> SessionResult<()> {
        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let recursive = self
            .run(&format!("test -d {}", shell_quote(remote_path)), None, &BTreeMap::new())
            .await?
            .success();
        self.scp(
            format!("{}:{}", self.destination(), remote_path),
            local_path.display().to_string(),
            recursive,
        )
        .await
    }

    async fn close(&self) -> SessionResult<()> {
        let status = Command::new("ssh")
            .args(self.ssh_args())
            .args(["-O", "exit"])
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = status {
            warn!("Failed to close control connection to {}: {}", self.host, e);
        }
        Ok(())
    }

    async fn open_tunnel(&self, spec: TunnelSpec) -> SessionResult<Tunnel> {
        debug!("Opening tunnel {} via {}", spec, self.host);
        let child = Command::new("ssh")
            .args(self.tunnel_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::Spawn {
                program: "ssh".to_string(),
                source,
            })?;
        Ok(Tunnel::Process(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session() -> SshSession {
        let config = SshConfig {
            port: 2222,
            user: Some("ops".to_string()),
            identity_file: Some(PathBuf::from("/keys/id_ed25519")),
            connect_timeout: Duration::from_secs(10),
            strict_host_key_checking: false,
        };
        SshSession::new("node-1", config)
    }

    #[test]
    fn test_ssh_args() {
        let args = session().ssh_args();
        assert_eq!(&args[..2], &["-p", "2222"]);
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.ends_with(&["-i".to_string(), "/keys/id_ed25519".to_string()]));
    }

    #[test]
    fn test_scp_uses_capital_port_flag() {
        let args = session().scp_args(false);
        assert_eq!(&args[..3], &["-q", "-P", "2222"]);
        assert!(!args.contains(&"-r".to_string()));
        assert_eq!(&session().scp_args(true)[..4], &["-q", "-P", "2222", "-r"]);
    }

    #[test]
    fn test_tunnel_args() {
        let session = session();
        let to = session.tunnel_args(TunnelSpec::ToRuntime {
            local_port: 60000,
            runtime_port: 8786,
        });
        assert!(to.ends_with(&[
            "-R".to_string(),
            "8786:localhost:60000".to_string(),
            "ops@node-1".to_string()
        ]));
        assert!(to.contains(&"-N".to_string()));

        let from = session.tunnel_args(TunnelSpec::FromRuntime {
            runtime_port: 9000,
            local_port: 5800,
        });
        assert!(from.ends_with(&[
            "-L".to_string(),
            "5800:localhost:9000".to_string(),
            "ops@node-1".to_string()
        ]));
    }

    #[test]
    fn test_destination_without_user() {
        let session = SshSession::new("node-2", SshConfig::default());
        assert_eq!(session.destination(), "node-2");
    }
}
