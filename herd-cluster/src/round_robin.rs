//! Round-robin worker placement

use async_trait::async_trait;
use herd_core::{remaining_ports, HerdError, HerdResult};
use herd_runtime::{ExecuteOptions, RuntimeGroup, RuntimeTask, TaskTarget};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::launcher::WorkerLauncher;

/// Placeholders available in worker command templates
pub const WORKER_PORT_PLACEHOLDER: &str = "{worker_port}";
pub const MASTER_PORT_PLACEHOLDER: &str = "{master_port}";
pub const WORKING_DIR_PLACEHOLDER: &str = "{working_dir}";
pub const WORKER_INDEX_PLACEHOLDER: &str = "{worker_index}";

/// Places worker `i` on the `i mod n`-th runtime of the group.
///
/// Every worker gets the first candidate port that is free in the whole
/// group, unless port allocation is disabled, and runs as a background task
/// that joins never wait for.
#[derive(Debug)]
pub struct RoundRobinLauncher {
    kind: String,
    launch_command: String,
    setup_commands: Vec<String>,
    allocate_ports: bool,
    worker_tunnels: bool,
    stream_output: bool,
    ports_per_host: BTreeMap<String, Vec<u16>>,
    tasks: Vec<RuntimeTask>,
}

impl RoundRobinLauncher {
    /// `kind` names the worker tasks (`launch-<kind>-worker-<i>`); the
    /// launch command may use the placeholders of this module
    pub fn new(kind: impl Into<String>, launch_command: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            launch_command: launch_command.into(),
            setup_commands: Vec::new(),
            allocate_ports: true,
            worker_tunnels: false,
            stream_output: false,
            ports_per_host: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Command run before the launch command of every worker
    pub fn with_setup_command(mut self, command: impl Into<String>) -> Self {
        self.setup_commands.push(command.into());
        self
    }

    /// Workers that do not listen on a port; the candidate ports are left untouched
    pub fn without_worker_ports(mut self) -> Self {
        self.allocate_ports = false;
        self
    }

    /// Connect the workers with each other after they started
    pub fn with_worker_tunnels(mut self, enabled: bool) -> Self {
        self.worker_tunnels = enabled;
        self
    }

    pub fn with_stream_output(mut self, enabled: bool) -> Self {
        self.stream_output = enabled;
        self
    }

    /// Worker tasks started so far
    pub fn tasks(&self) -> &[RuntimeTask] {
        &self.tasks
    }

    /// Launch command of one worker
    pub fn launch_command(&self, worker_index: usize, master_port: u16, worker_port: u16, working_dir: &str) -> String {
        self.render(worker_index, master_port, Some(worker_port), working_dir)
    }

    fn render(&self, worker_index: usize, master_port: u16, worker_port: Option<u16>, working_dir: &str) -> String {
        let command = match worker_port {
            Some(port) => self.launch_command.replace(WORKER_PORT_PLACEHOLDER, &port.to_string()),
            None => self.launch_command.clone(),
        };
        command
            .replace(MASTER_PORT_PLACEHOLDER, &master_port.to_string())
            .replace(WORKING_DIR_PLACEHOLDER, working_dir)
            .replace(WORKER_INDEX_PLACEHOLDER, &worker_index.to_string())
    }

    fn worker_task(&self, worker_index: usize, command: String) -> HerdResult<RuntimeTask> {
        let mut task = RuntimeTask::new(format!("launch-{}-worker-{}", self.kind, worker_index));
        for setup in &self.setup_commands {
            task = task.run_command(setup.clone())?;
        }
        task.run_command(command)
    }
}

#[async_trait]
impl WorkerLauncher for RoundRobinLauncher {
    async fn start(
        &mut self,
        group: &mut RuntimeGroup,
        worker_count: usize,
        master_port: u16,
        ports: Vec<u16>,
    ) -> HerdResult<Vec<u16>> {
        let hosts: Vec<String> = group.hosts().into_iter().map(str::to_string).collect();
        if hosts.is_empty() {
            return Err(HerdError::NoRuntimesDetected(
                "no runtime to place workers on".to_string(),
            ));
        }
        info!(
            "Starting {} {} worker(s) on {} runtime(s)",
            worker_count,
            self.kind,
            hosts.len()
        );

        let mut ports = ports;
        for worker_index in 0..worker_count {
            let host = &hosts[worker_index % hosts.len()];
            let worker_port = if self.allocate_ports {
                if ports.is_empty() {
                    return Err(HerdError::NoPortsLeft);
                }
                let port = group.get_free_port(&ports, false).await?;
                ports = remaining_ports(&ports, port);
                Some(port)
            } else {
                None
            };

            let working_dir = group.get_runtime(Some(host.as_str()))?.working_dir().to_string();
            let command = self.render(worker_index, master_port, worker_port, &working_dir);
            let task = self.worker_task(worker_index, command)?;
            debug!("Launching worker {} on {} (port {:?})", worker_index, host, worker_port);

            let options = ExecuteOptions::background()
                .omit_on_join(true)
                .stream_output(self.stream_output);
            group
                .execute_task(&task, TaskTarget::Host(host.clone()), options)
                .await?;
            self.tasks.push(task);
            let host_ports = self.ports_per_host.entry(host.clone()).or_default();
            host_ports.extend(worker_port);
        }

        if self.worker_tunnels {
            self.setup_worker_ssh_tunnels(group).await?;
        }
        Ok(ports)
    }

    fn ports_per_host(&self) -> &BTreeMap<String, Vec<u16>> {
        &self.ports_per_host
    }

    async fn cleanup(&mut self, group: &mut RuntimeGroup) -> HerdResult<()> {
        for task in self.tasks.drain(..) {
            let (Some(host), Some(key)) = (task.host(), task.process_key()) else {
                continue;
            };
            let Ok(runtime) = group.get_runtime(Some(host.as_str())) else {
                continue;
            };
            match runtime.stop_process(&key).await {
                Ok(()) | Err(HerdError::UnknownProcess(_)) => {}
                Err(e) => warn!("Could not stop worker {}: {}", task.name(), e),
            }
        }
        self.ports_per_host.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_config::HerdConfig;
    use herd_runtime::Runtime;
    use herd_session::MockSession;
    use std::sync::Arc;
    use std::time::Duration;

    async fn mock_group(sessions: &[MockSession]) -> RuntimeGroup {
        let mut config = HerdConfig::default();
        config.logging.file_logging = false;
        config.runtime.tunnel_settle_delay = Duration::from_millis(5);
        let config = Arc::new(config);
        let mut runtimes = Vec::new();
        for session in sessions {
            runtimes.push(
                Runtime::connect(Arc::new(session.clone()), None, Arc::clone(&config))
                    .await
                    .unwrap(),
            );
        }
        RuntimeGroup::with_config(runtimes, config).unwrap()
    }

    fn worker_launcher() -> RoundRobinLauncher {
        RoundRobinLauncher::new(
            "test",
            "worker --port={worker_port} --dir={working_dir} localhost:{master_port}",
        )
    }

    #[tokio::test]
    async fn test_workers_are_spread_evenly() {
        let sessions = [MockSession::new("a"), MockSession::new("b"), MockSession::new("c")];
        let mut group = mock_group(&sessions).await;
        let mut launcher = worker_launcher();

        let ports: Vec<u16> = (61000..61010).collect();
        let remaining = launcher.start(&mut group, 5, 60000, ports).await.unwrap();
        assert_eq!(remaining, (61005..61010).collect::<Vec<u16>>());

        let counts: Vec<usize> = ["a", "b", "c"]
            .iter()
            .map(|h| launcher.ports_per_host().get(*h).map_or(0, Vec::len))
            .collect();
        assert_eq!(counts, vec![2, 2, 1]);
        let spread = counts.iter().max().unwrap() - counts.iter().min().unwrap();
        assert!(spread <= 1);

        assert_eq!(launcher.tasks()[3].name(), "launch-test-worker-3");
        // Let the background worker tasks run
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(launcher.tasks().iter().all(RuntimeTask::is_omitted_on_join));
        assert!(sessions[0]
            .commands()
            .iter()
            .any(|c| c == "worker --port=61000 --dir=/tmp/herd-mock localhost:60000"));
    }

    #[tokio::test]
    async fn test_busy_ports_are_skipped() {
        let sessions = [MockSession::new("a").with_busy_port(61000), MockSession::new("b")];
        let mut group = mock_group(&sessions).await;
        let mut launcher = worker_launcher();

        let remaining = launcher
            .start(&mut group, 2, 60000, vec![61000, 61001, 61002, 61003])
            .await
            .unwrap();
        // Skipped busy candidates are not handed back, only those after the last chosen port
        assert_eq!(remaining, vec![61003]);
        assert_eq!(launcher.ports_per_host()["a"], vec![61001]);
        assert_eq!(launcher.ports_per_host()["b"], vec![61002]);
    }

    #[tokio::test]
    async fn test_running_out_of_ports() {
        let sessions = [MockSession::new("a"), MockSession::new("b")];
        let mut group = mock_group(&sessions).await;
        let mut launcher = worker_launcher();

        let err = launcher
            .start(&mut group, 3, 60000, vec![61000, 61001])
            .await
            .unwrap_err();
        assert!(matches!(err, HerdError::NoPortsLeft));
        assert_eq!(launcher.tasks().len(), 2);
    }

    #[tokio::test]
    async fn test_worker_tunnels_connect_every_runtime() {
        let sessions = [MockSession::new("a"), MockSession::new("b")];
        let mut group = mock_group(&sessions).await;
        let mut launcher = worker_launcher().with_worker_tunnels(true);

        launcher.start(&mut group, 2, 60000, vec![61100, 61101]).await.unwrap();
        // One outgoing and one incoming tunnel per worker and runtime
        assert_eq!(sessions[0].tunnels().len(), 2);
        assert_eq!(sessions[1].tunnels().len(), 2);

        launcher.cleanup(&mut group).await.unwrap();
        assert!(launcher.ports_per_host().is_empty());
        assert!(launcher.tasks().is_empty());
    }
}
