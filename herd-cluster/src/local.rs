//! Master started on the control node

use async_trait::async_trait;
use herd_config::HerdConfig;
use herd_core::{
    local_port_is_free, remaining_ports, HerdError, HerdResult, PortCandidates, PortScope,
    ProcessKey, ProcessKind, LOCALHOST,
};
use herd_resilience::{ProbeStatus, ReadinessPoll};
use herd_runtime::{ProcessBackend, ProcessHandle, RuntimeGroup};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::launcher::{MasterLaunch, MasterLauncher};

/// Placeholder of the master port in command templates
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Runs the master command locally and exposes its port to every runtime.
///
/// The master counts as ready once its port is bound on the control node.
/// A detached master (one that forks into the background) is stopped with
/// its stop command instead of through its process.
#[derive(Debug)]
pub struct LocalMasterLauncher {
    name: String,
    start_command: String,
    stop_command: Option<String>,
    detached: bool,
    poll_initial_delay: Duration,
    poll_max_delay: Duration,
    stop_grace_period: Duration,
    port: Option<u16>,
    process: Option<ProcessHandle>,
}

impl LocalMasterLauncher {
    /// `start_command` may contain `{port}`, replaced by the chosen port
    pub fn new(name: impl Into<String>, start_command: impl Into<String>, config: &HerdConfig) -> Self {
        Self {
            name: name.into(),
            start_command: start_command.into(),
            stop_command: None,
            detached: false,
            poll_initial_delay: config.cluster.poll_initial_delay,
            poll_max_delay: config.cluster.poll_max_delay,
            stop_grace_period: config.runtime.stop_grace_period,
            port: None,
            process: None,
        }
    }

    /// Command run on cleanup; may contain `{port}`
    pub fn with_stop_command(mut self, command: impl Into<String>) -> Self {
        self.stop_command = Some(command.into());
        self
    }

    /// The start command returns once the master runs in the background
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start command for `port`
    pub fn start_command(&self, port: u16) -> String {
        self.start_command.replace(PORT_PLACEHOLDER, &port.to_string())
    }

    /// Stop command for `port`, if any
    pub fn stop_command(&self, port: u16) -> Option<String> {
        self.stop_command
            .as_ref()
            .map(|command| command.replace(PORT_PLACEHOLDER, &port.to_string()))
    }

    async fn choose_port(&self, group: &RuntimeGroup, ports: &PortCandidates) -> HerdResult<(u16, Vec<u16>)> {
        match ports {
            PortCandidates::Single(port) => {
                if local_port_is_free(*port).await && group.has_free_port(*port, &[LOCALHOST]).await? {
                    Ok((*port, Vec::new()))
                } else {
                    Err(HerdError::PortInUse {
                        port: *port,
                        scope: PortScope::Group,
                    })
                }
            }
            PortCandidates::List(candidates) => {
                let port = group.get_free_port(candidates, true).await?;
                Ok((port, remaining_ports(candidates, port)))
            }
        }
    }

    async fn wait_until_ready(&self, handle: &mut ProcessHandle, port: u16, timeout: Duration) -> Result<u32, String> {
        let poll = ReadinessPoll::with_delays(timeout, self.poll_initial_delay, self.poll_max_delay);
        let detached = self.detached;
        poll.wait_until_ready(|_| {
            let exited = !detached && !handle.is_alive();
            async move {
                if !local_port_is_free(port).await {
                    ProbeStatus::Ready
                } else if exited {
                    ProbeStatus::Failed("the master process exited".to_string())
                } else {
                    ProbeStatus::NotReady(format!("port {} is still free", port))
                }
            }
        })
        .await
        .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl MasterLauncher for LocalMasterLauncher {
    async fn start(
        &mut self,
        group: &mut RuntimeGroup,
        ports: PortCandidates,
        timeout: Duration,
    ) -> HerdResult<MasterLaunch> {
        if let Some(port) = self.port {
            return Err(HerdError::InvalidArgument(format!(
                "{} already runs on port {}",
                self.name, port
            )));
        }

        let (port, remaining_ports) = self.choose_port(group, &ports).await?;
        let command = self.start_command(port);
        info!("Starting {} on localhost: {}", self.name, command);

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HerdError::MasterStart {
                host: LOCALHOST.to_string(),
                port,
                cause: e.to_string(),
            })?;
        let key = ProcessKey::task(LOCALHOST, &self.name, u64::from(port));
        let mut handle = ProcessHandle::new(key, ProcessKind::Task, ProcessBackend::Child(child));

        if let Err(cause) = self.wait_until_ready(&mut handle, port, timeout).await {
            debug!("{} did not become ready on port {}", self.name, port);
            if let Err(e) = handle.stop(self.stop_grace_period).await {
                warn!("Could not stop {}: {}", self.name, e);
            }
            return Err(HerdError::MasterStart {
                host: LOCALHOST.to_string(),
                port,
                cause,
            });
        }

        info!("{} ready on localhost port {}", self.name, port);
        self.port = Some(port);
        if !self.detached {
            self.process = Some(handle);
        }

        group.expose_port_to_runtimes(port, None, &[]).await?;
        Ok(MasterLaunch {
            port,
            remaining_ports,
        })
    }

    fn port(&self) -> Option<u16> {
        self.port
    }

    fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    async fn cleanup(&mut self, _group: &mut RuntimeGroup) -> HerdResult<()> {
        let Some(port) = self.port.take() else {
            return Ok(());
        };
        debug!("Cleaning up {}", self.name);

        if let Some(command) = self.stop_command(port) {
            let status = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .stdin(Stdio::null())
                .status()
                .await?;
            if status.success() {
                info!("{} stopped", self.name);
            } else {
                warn!("`{}` exited with {}", command, status);
            }
        }

        if let Some(mut process) = self.process.take() {
            process.stop(self.stop_grace_period).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_runtime::Runtime;
    use herd_session::MockSession;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Instant;

    fn test_config() -> Arc<HerdConfig> {
        let mut config = HerdConfig::default();
        config.logging.file_logging = false;
        config.runtime.tunnel_settle_delay = Duration::from_millis(5);
        config.cluster.poll_initial_delay = Duration::from_millis(50);
        config.cluster.poll_max_delay = Duration::from_millis(200);
        Arc::new(config)
    }

    async fn mock_group(hosts: &[&str]) -> (RuntimeGroup, Vec<MockSession>) {
        let config = test_config();
        let mut runtimes = Vec::new();
        let mut sessions = Vec::new();
        for host in hosts {
            let session = MockSession::new(*host);
            runtimes.push(
                Runtime::connect(Arc::new(session.clone()), None, Arc::clone(&config))
                    .await
                    .unwrap(),
            );
            sessions.push(session);
        }
        (RuntimeGroup::with_config(runtimes, config).unwrap(), sessions)
    }

    fn free_local_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_command_templates() {
        let launcher = LocalMasterLauncher::new("db", "db --port {port}", &HerdConfig::default())
            .with_stop_command("db --stop {port}");
        assert_eq!(launcher.start_command(27017), "db --port 27017");
        assert_eq!(launcher.stop_command(27017).as_deref(), Some("db --stop 27017"));
    }

    #[tokio::test]
    async fn test_master_that_never_binds_times_out() {
        let (mut group, _) = mock_group(&["a"]).await;
        let mut launcher = LocalMasterLauncher::new("idle", "sleep 30", &test_config());
        let port = free_local_port();

        let started = Instant::now();
        let err = launcher
            .start(&mut group, PortCandidates::Single(port), Duration::from_secs(1))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        match err {
            HerdError::MasterStart { host, port: p, .. } => {
                assert_eq!(host, LOCALHOST);
                assert_eq!(p, port);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(4));
        assert!(launcher.port().is_none());
        assert!(launcher.process().is_none());
    }

    #[tokio::test]
    async fn test_master_that_exits_fails_fast() {
        let (mut group, _) = mock_group(&["a"]).await;
        let mut launcher = LocalMasterLauncher::new("broken", "exit 1", &test_config());

        let started = Instant::now();
        let err = launcher
            .start(&mut group, PortCandidates::Single(free_local_port()), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, HerdError::MasterStart { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_busy_single_port_is_rejected() {
        let (mut group, _) = mock_group(&["a"]).await;
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let mut launcher = LocalMasterLauncher::new("m", "sleep 30", &test_config());

        let err = launcher
            .start(&mut group, PortCandidates::Single(port), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HerdError::PortInUse { .. }));
    }

    #[tokio::test]
    async fn test_ready_master_is_exposed_to_runtimes() {
        let (mut group, sessions) = mock_group(&["a", "b"]).await;
        let port = free_local_port();
        let mut launcher = LocalMasterLauncher::new("master", "sleep 30", &test_config());

        // Stands in for the master binding its port shortly after start
        let binder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(listener);
        });

        let launch = launcher
            .start(&mut group, vec![port].into(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(launch.port, port);
        assert!(launch.remaining_ports.is_empty());
        assert_eq!(launcher.port(), Some(port));
        assert!(launcher.process().is_some());
        assert!(sessions.iter().all(|s| s.tunnels().len() == 1));

        launcher.cleanup(&mut group).await.unwrap();
        assert!(launcher.port().is_none());
        launcher.cleanup(&mut group).await.unwrap();
        binder.abort();
    }
}
