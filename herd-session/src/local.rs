//! Session for the control node itself

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{SessionError, SessionResult};
use crate::relay::spawn_relay;
use crate::session::{compose_script, CommandOutput, RemoteSession, Tunnel, TunnelSpec};

/// Runs commands through `sh -c` on the control node.
///
/// The host name defaults to `localhost`; tests give several local sessions
/// distinct names to stand in for separate hosts.
#[derive(Debug, Clone)]
pub struct LocalSession {
    host: String,
}

impl LocalSession {
    pub fn new() -> Self {
        Self::named(herd_core::LOCALHOST)
    }

    pub fn named(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Default for LocalSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
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
        debug!("Running locally as {}: {}", self.host, command);

        let output = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SessionError::Spawn {
                program: "sh".to_string(),
                source,
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> SessionResult<()> {
        copy_path(local_path, Path::new(remote_path)).await
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> SessionResult<()> {
        copy_path(Path::new(remote_path), local_path).await
    }

    async fn close(&self) -> SessionResult<()> {
        Ok(())
    }

    async fn is_port_free(&self, port: u16) -> SessionResult<bool> {
        Ok(herd_core::local_port_is_free(port).await)
    }

    async fn open_tunnel(&self, spec: TunnelSpec) -> SessionResult<Tunnel> {
        let handle = spawn_relay(spec.listen_port(), spec.target_port())
            .await
            .map_err(|e| SessionError::Tunnel(format!("{}: {}", spec, e)))?;
        Ok(Tunnel::Relay(handle))
    }
}

/// Copy a file, or a directory tree merged into `to`
async fn copy_path(from: &Path, to: &Path) -> SessionResult<()> {
    let transfer_error = |message: String| SessionError::Transfer {
        from: from.display().to_string(),
        to: to.display().to_string(),
        message,
    };

    let metadata = tokio::fs::metadata(from)
        .await
        .map_err(|e| transfer_error(e.to_string()))?;
    if metadata.is_dir() {
        let (source, target) = (from.to_path_buf(), to.to_path_buf());
        return tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| transfer_error(e.to_string()))?
            .map_err(|e| transfer_error(e.to_string()));
    }

    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transfer_error(e.to_string()))?;
        }
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| transfer_error(e.to_string()))?;
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from).follow_links(true) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
