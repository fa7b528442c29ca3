//! Scripted session for tests
//!
//! Clones share state, so a test can keep one clone for inspection while the
//! runtime owns another.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{SessionError, SessionResult};
use crate::session::{CommandOutput, RemoteSession, Tunnel, TunnelSpec};

pub const MOCK_HOME: &str = "/home/mock";
pub const MOCK_TEMPDIR: &str = "/tmp/herd-mock";

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    output: CommandOutput,
}

#[derive(Debug, Default)]
struct MockState {
    rules: Vec<Rule>,
    busy_ports: HashSet<u16>,
    commands: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    tunnels: Vec<TunnelSpec>,
    connect_error: Option<String>,
    closed: bool,
}

/// Session whose command results are scripted by substring rules
#[derive(Debug, Clone)]
pub struct MockSession {
    host: String,
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Commands containing `pattern` succeed with `stdout`
    pub fn with_response(self, pattern: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.add_rule(pattern, CommandOutput::new(stdout, "", 0));
        self
    }

    /// Commands containing `pattern` exit with `exit_code`
    pub fn with_failure(
        self,
        pattern: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        self.add_rule(pattern, CommandOutput::new("", stderr, exit_code));
        self
    }

    pub fn with_busy_port(self, port: u16) -> Self {
        self.occupy_port(port);
        self
    }

    /// Every operation fails as if the host were unreachable
    pub fn unreachable(self, message: impl Into<String>) -> Self {
        self.state().connect_error = Some(message.into());
        self
    }

    pub fn add_rule(&self, pattern: impl Into<String>, output: CommandOutput) {
        self.state().rules.push(Rule {
            pattern: pattern.into(),
            output,
        });
    }

    pub fn occupy_port(&self, port: u16) {
        self.state().busy_ports.insert(port);
    }

    pub fn release_port(&self, port: u16) {
        self.state().busy_ports.remove(&port);
    }

    /// Commands run so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn tunnels(&self) -> Vec<TunnelSpec> {
        self.state().tunnels.clone()
    }

    pub fn put_file(&self, remote_path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.state().files.insert(remote_path.into(), content.into());
    }

    pub fn file(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.state().files.get(remote_path).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn check_reachable(&self) -> SessionResult<()> {
        match &self.state().connect_error {
            Some(message) => Err(SessionError::ConnectionFailed {
                host: self.host.clone(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn connect(&self) -> SessionResult<()> {
        self.check_reachable()
    }

    async fn run(
        &self,
        command: &str,
        _cwd: Option<&str>,
        _env: &BTreeMap<String, String>,
    ) -> SessionResult<CommandOutput> {
        self.check_reachable()?;
        let mut state = self.state();
        state.commands.push(command.to_string());

        if let Some(rule) = state.rules.iter().find(|r| command.contains(&r.pattern)) {
            return Ok(rule.output.clone());
        }
        let stdout = if command.contains("mktemp") {
            format!("{}\n", MOCK_TEMPDIR)
        } else if command.trim() == "pwd" {
            format!("{}\n", MOCK_HOME)
        } else {
            String::new()
        };
        Ok(CommandOutput::new(stdout, "", 0))
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> SessionResult<()> {
        self.check_reachable()?;
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| SessionError::Transfer {
                from: local_path.display().to_string(),
                to: remote_path.to_string(),
                message: e.to_string(),
            })?;
        self.put_file(remote_path, content);
        Ok(())
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> SessionResult<()> {
        self.check_reachable()?;
        let content = self.file(remote_path).ok_or_else(|| SessionError::Transfer {
            from: remote_path.to_string(),
            to: local_path.display().to_string(),
            message: "no such file".to_string(),
        })?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, content).await?;
        Ok(())
    }

    async fn close(&self) -> SessionResult<()> {
        self.state().closed = true;
        Ok(())
    }

    async fn is_port_free(&self, port: u16) -> SessionResult<bool> {
        self.check_reachable()?;
        Ok(!self.state().busy_ports.contains(&port))
    }

    async fn open_tunnel(&self, spec: TunnelSpec) -> SessionResult<Tunnel> {
        self.check_reachable()?;
        {
            let mut state = self.state();
            if let TunnelSpec::ToRuntime { runtime_port, .. } = spec {
                if !state.busy_ports.insert(runtime_port) {
                    return Err(SessionError::Tunnel(format!(
                        "port {} already forwarded on {}",
                        runtime_port, self.host
                    )));
                }
            }
            state.tunnels.push(spec);
        }
        Ok(Tunnel::Relay(tokio::spawn(std::future::pending::<()>())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_and_defaults() {
        let mock = MockSession::new("m").with_response("echo a", "a\n");
        let env = BTreeMap::new();
        assert_eq!(mock.run("echo a", None, &env).await.unwrap().stdout, "a\n");
        assert_eq!(mock.run("pwd", None, &env).await.unwrap().stdout, "/home/mock\n");
        assert_eq!(mock.commands(), vec!["echo a".to_string(), "pwd".to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let mock = MockSession::new("m").unreachable("no route");
        assert!(mock.connect().await.unwrap_err().is_connection_error());
    }
}
