//! Runtime groups
//!
//! A [`RuntimeGroup`] keeps its runtimes in insertion order with unique
//! hosts. Port negotiation across the group is check-then-act: a port that
//! every relevant member reports free is used right away, without a
//! reservation, so concurrent negotiations against the same hosts can pick
//! the same port.

use futures::future::join_all;
use herd_config::HerdConfig;
use herd_core::{
    local_port_is_free, HerdError, HerdResult, PortCandidates, PortScope, ProcessKey, LOCALHOST,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::runtime::{ExecuteOptions, Runtime};
use crate::task::{FunctionReturns, RuntimeTask};

/// Where a group executes a task
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskTarget {
    /// The member with the fewest running task processes
    #[default]
    LeastBusy,
    Host(String),
    /// An independent copy of the task on every member
    Broadcast,
}

/// Tasks started by [`RuntimeGroup::execute_task`]
#[derive(Debug, Clone)]
pub enum Dispatched {
    Single(RuntimeTask),
    Broadcast(Vec<RuntimeTask>),
}

impl Dispatched {
    pub fn tasks(&self) -> &[RuntimeTask] {
        match self {
            Dispatched::Single(task) => std::slice::from_ref(task),
            Dispatched::Broadcast(tasks) => tasks,
        }
    }

    pub fn into_tasks(self) -> Vec<RuntimeTask> {
        match self {
            Dispatched::Single(task) => vec![task],
            Dispatched::Broadcast(tasks) => tasks,
        }
    }

    pub fn into_single(self) -> Option<RuntimeTask> {
        match self {
            Dispatched::Single(task) => Some(task),
            Dispatched::Broadcast(_) => None,
        }
    }
}

/// Several runtimes with group-wide port coordination
#[derive(Debug)]
pub struct RuntimeGroup {
    runtimes: Vec<Runtime>,
    config: Arc<HerdConfig>,
    /// Next candidate of the internal port range used for relayed ports
    port_cursor: u16,
    tasks: Vec<RuntimeTask>,
    tunnels: Vec<(String, ProcessKey)>,
    cleaned_up: bool,
}

impl RuntimeGroup {
    /// Group the given runtimes, taking the configuration of the first one
    pub fn new(runtimes: Vec<Runtime>) -> HerdResult<Self> {
        let config = runtimes
            .first()
            .map(|runtime| Arc::clone(runtime.config()))
            .ok_or_else(|| HerdError::NoRuntimesDetected("runtime group is empty".to_string()))?;
        Self::with_config(runtimes, config)
    }

    pub fn with_config(runtimes: Vec<Runtime>, config: Arc<HerdConfig>) -> HerdResult<Self> {
        if runtimes.is_empty() {
            return Err(HerdError::NoRuntimesDetected(
                "runtime group is empty".to_string(),
            ));
        }
        let mut group = Self {
            runtimes: Vec::with_capacity(runtimes.len()),
            port_cursor: config.ports.group_port_range.start,
            config,
            tasks: Vec::new(),
            tunnels: Vec::new(),
            cleaned_up: false,
        };
        for runtime in runtimes {
            group.add_runtime(runtime)?;
        }
        info!("Runtime group created with hosts {:?}", group.hosts());
        Ok(group)
    }

    /// Connect every host over ssh, or locally for `localhost`
    pub async fn from_hosts<I, S>(hosts: I, working_dir: Option<&str>, config: Arc<HerdConfig>) -> HerdResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut runtimes = Vec::new();
        for host in hosts {
            let host = host.into();
            let runtime = if host == LOCALHOST {
                Runtime::local(working_dir, Arc::clone(&config)).await?
            } else {
                Runtime::ssh(host, working_dir, Arc::clone(&config)).await?
            };
            runtimes.push(runtime);
        }
        Self::with_config(runtimes, config)
    }

    pub fn config(&self) -> &Arc<HerdConfig> {
        &self.config
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.runtimes.iter().map(Runtime::host).collect()
    }

    pub fn runtimes(&self) -> &[Runtime] {
        &self.runtimes
    }

    pub fn runtime_count(&self) -> usize {
        self.runtimes.len()
    }

    pub fn contains_runtime(&self, host: &str) -> bool {
        self.position(host).is_some()
    }

    /// Add a runtime; its host must not be a member yet
    pub fn add_runtime(&mut self, runtime: Runtime) -> HerdResult<()> {
        if self.contains_runtime(runtime.host()) {
            return Err(HerdError::InvalidArgument(format!(
                "host {} is already part of the runtime group",
                runtime.host()
            )));
        }
        debug!("Adding runtime {} to group", runtime.host());
        self.runtimes.push(runtime);
        Ok(())
    }

    /// Take a runtime out of the group without cleaning it up
    pub fn remove_runtime(&mut self, host: &str) -> Option<Runtime> {
        match self.position(host) {
            Some(index) => Some(self.runtimes.remove(index)),
            None => {
                warn!("Runtime {} is not part of the group, nothing removed", host);
                None
            }
        }
    }

    /// The runtime of `host`, or the least busy member when no host is given
    pub fn get_runtime(&mut self, host: Option<&str>) -> HerdResult<&mut Runtime> {
        let index = match host {
            Some(host) => self.position_or_err(host)?,
            None => self.least_busy(),
        };
        Ok(&mut self.runtimes[index])
    }

    /// Members restricted to `include` or, alternatively, all but `exclude`
    pub fn get_runtimes(&self, include: &[&str], exclude: &[&str]) -> HerdResult<Vec<&Runtime>> {
        let indices = self.select(include, exclude)?;
        Ok(indices.into_iter().map(|i| &self.runtimes[i]).collect())
    }

    /// Execute `task` on one member or broadcast copies to all of them.
    ///
    /// A broadcast gives the first member `task` itself and every further
    /// member a fresh duplicate. A failing member does not stop the others;
    /// its failure is kept on its task.
    pub async fn execute_task(
        &mut self,
        task: &RuntimeTask,
        target: TaskTarget,
        options: ExecuteOptions,
    ) -> HerdResult<Dispatched> {
        task.set_omit_on_join(options.omit_on_join);

        let index = match target {
            TaskTarget::Broadcast => return self.broadcast(task, options).await,
            TaskTarget::Host(host) => self.position_or_err(&host)?,
            TaskTarget::LeastBusy => self.least_busy(),
        };

        debug!(
            "Executing task {} on {} of the group",
            task.name(),
            self.runtimes[index].host()
        );
        self.tasks.push(task.clone());
        self.runtimes[index].execute_task(task, options).await?;
        Ok(Dispatched::Single(task.clone()))
    }

    async fn broadcast(&mut self, task: &RuntimeTask, options: ExecuteOptions) -> HerdResult<Dispatched> {
        debug!("Broadcasting task {} in the group", task.name());
        let mut dispatched = Vec::with_capacity(self.runtimes.len());

        for (index, runtime) in self.runtimes.iter_mut().enumerate() {
            let copy = if index == 0 {
                task.clone()
            } else {
                task.duplicate(index)
            };
            self.tasks.push(copy.clone());

            if let Err(e) = runtime.execute_task(&copy, options).await {
                if e.as_task_error().is_none() {
                    return Err(e);
                }
                warn!("Broadcast of task {} failed on {}: {}", task.name(), runtime.host(), e);
            }
            dispatched.push(copy);
        }
        Ok(Dispatched::Broadcast(dispatched))
    }

    /// First candidate free on every member and, if asked, on the control node
    pub async fn get_free_port(&self, candidates: &[u16], also_check_local: bool) -> HerdResult<u16> {
        let all: Vec<usize> = (0..self.runtimes.len()).collect();
        let check_local = also_check_local && !self.contains_runtime(LOCALHOST);
        self.free_port_among(&all, candidates, check_local).await
    }

    /// Whether `port` is free on every member except `exclude`
    pub async fn has_free_port(&self, port: u16, exclude: &[&str]) -> HerdResult<bool> {
        let indices = self.select(&[], exclude)?;
        self.port_free_on(&indices, port).await
    }

    /// Forward `local_port` of the control node to every member except `exclude`.
    ///
    /// The runtime port defaults to `local_port`. A single candidate that is
    /// busy fails with `PortInUse`; an exhausted list with `NoPortsLeft`.
    /// Returns the runtime port that was used.
    pub async fn expose_port_to_runtimes(
        &mut self,
        local_port: u16,
        runtime_ports: Option<PortCandidates>,
        exclude: &[&str],
    ) -> HerdResult<u16> {
        info!("Exposing local port {} in the runtime group", local_port);
        let runtime_ports = runtime_ports.unwrap_or(PortCandidates::Single(local_port));
        let targets = self.select(&[], exclude)?;
        // The control node itself serves the port
        let checked: Vec<usize> = targets
            .iter()
            .copied()
            .filter(|&i| self.runtimes[i].host() != LOCALHOST)
            .collect();
        let runtime_port = self.resolve_port(&checked, &runtime_ports).await?;

        for index in targets {
            let runtime = &mut self.runtimes[index];
            if let Some(key) = runtime.expose_port_to_runtime(local_port, Some(runtime_port)).await? {
                self.tunnels.push((runtime.host().to_string(), key));
            }
        }
        debug!("Port {} used as runtime port", runtime_port);
        Ok(runtime_port)
    }

    /// Make `runtime_port` of `host` reachable on every other member.
    ///
    /// Traffic is relayed over the control node: the source runtime is
    /// forwarded to a free local port, which is then exposed to the rest of
    /// the group as the group port. Returns the group port.
    pub async fn expose_port_from_runtime_to_group(
        &mut self,
        host: &str,
        runtime_port: u16,
        group_ports: Option<PortCandidates>,
    ) -> HerdResult<u16> {
        let source = self.position_or_err(host)?;
        info!(
            "Exposing port {} of runtime {} in the runtime group",
            runtime_port, host
        );

        let group_ports = group_ports.unwrap_or(PortCandidates::Single(runtime_port));
        let others: Vec<usize> = (0..self.runtimes.len()).filter(|&i| i != source).collect();
        let group_port = self.resolve_port(&others, &group_ports).await?;
        let local_port = self.free_local_port(group_port).await?;

        for index in 0..self.runtimes.len() {
            let runtime = &mut self.runtimes[index];
            let key = if index == source {
                runtime.expose_port_from_runtime(runtime_port, Some(local_port)).await?
            } else {
                runtime.expose_port_to_runtime(local_port, Some(group_port)).await?
            };
            if let Some(key) = key {
                self.tunnels.push((runtime.host().to_string(), key));
            }
        }
        debug!("Port {} used as group port", group_port);
        Ok(group_port)
    }

    /// Wait for every task started through the group
    pub async fn join(&self) -> HerdResult<()> {
        info!("Joining {} task(s) of the runtime group", self.tasks.len());
        let results = join_all(self.tasks.iter().map(|task| task.join())).await;
        results.into_iter().collect::<HerdResult<Vec<()>>>()?;
        Ok(())
    }

    /// Send a local file to every member, synchronously
    pub async fn send_file(&mut self, local_path: impl Into<PathBuf>, remote_path: Option<&str>) -> HerdResult<()> {
        let local_path = local_path.into();
        for runtime in &mut self.runtimes {
            runtime.send_file(local_path.clone(), remote_path).await?;
        }
        Ok(())
    }

    pub fn set_env_variables(&mut self, variables: BTreeMap<String, String>) {
        for runtime in &mut self.runtimes {
            runtime.set_env_variables(variables.clone());
        }
    }

    pub fn add_env_variables(&mut self, variables: BTreeMap<String, String>) {
        for runtime in &mut self.runtimes {
            runtime.add_env_variables(variables.clone());
        }
    }

    /// Tasks started through the group, in start order
    pub fn tasks(&self) -> &[RuntimeTask] {
        &self.tasks
    }

    /// Keys of the live task processes of all members
    pub fn task_processes(&mut self) -> Vec<ProcessKey> {
        self.runtimes
            .iter_mut()
            .flat_map(|runtime| runtime.process_keys(true))
            .filter(ProcessKey::is_task)
            .collect()
    }

    /// Return values of all group tasks, in task order
    pub async fn function_returns(&self) -> HerdResult<FunctionReturns> {
        let mut values = FunctionReturns::new(Vec::new());
        for task in &self.tasks {
            values.extend(task.function_returns().await?);
        }
        Ok(values)
    }

    pub fn print_log(&self) {
        for runtime in &self.runtimes {
            println!("Execution log of runtime {}:", runtime.host());
            runtime.print_log(None);
        }
    }

    /// Forget all tasks of the group and its members
    pub fn clear_tasks(&mut self) {
        self.tasks.clear();
        for runtime in &mut self.runtimes {
            runtime.clear_tasks();
        }
    }

    /// Stop the processes of every member and forget the group tunnels
    pub async fn stop_all_processes(&mut self) -> HerdResult<()> {
        let mut first_error = None;
        for runtime in &mut self.runtimes {
            if let Err(e) = runtime.stop_all_processes().await {
                warn!("Stopping processes on {} failed: {}", runtime.host(), e);
                first_error.get_or_insert(e);
            }
        }
        self.tunnels.clear();
        first_error.map_or(Ok(()), Err)
    }

    /// Clean up every member; calling it again does nothing
    pub async fn cleanup(&mut self) -> HerdResult<()> {
        if self.cleaned_up {
            return Ok(());
        }
        self.cleaned_up = true;
        info!("Cleaning up runtime group");

        let mut first_error = None;
        for runtime in &mut self.runtimes {
            if let Err(e) = runtime.cleanup().await {
                warn!("Cleanup of runtime {} failed: {}", runtime.host(), e);
                first_error.get_or_insert(e);
            }
        }
        self.tunnels.clear();
        first_error.map_or(Ok(()), Err)
    }

    /// Tunnels opened by group port exposure, with their hosts
    pub fn tunnels(&self) -> &[(String, ProcessKey)] {
        &self.tunnels
    }

    async fn resolve_port(&self, indices: &[usize], candidates: &PortCandidates) -> HerdResult<u16> {
        match candidates {
            PortCandidates::Single(port) => {
                if self.port_free_on(indices, *port).await? {
                    Ok(*port)
                } else {
                    Err(HerdError::PortInUse {
                        port: *port,
                        scope: PortScope::Group,
                    })
                }
            }
            PortCandidates::List(ports) => self.free_port_among(indices, ports, false).await,
        }
    }

    async fn free_port_among(&self, indices: &[usize], candidates: &[u16], check_local: bool) -> HerdResult<u16> {
        if candidates.is_empty() {
            return Err(HerdError::NoPortsLeft);
        }
        for &port in candidates {
            if check_local && !local_port_is_free(port).await {
                continue;
            }
            if self.port_free_on(indices, port).await? {
                debug!("Port {} is free in the runtime group", port);
                return Ok(port);
            }
        }
        Err(HerdError::NoPortsLeft)
    }

    async fn port_free_on(&self, indices: &[usize], port: u16) -> HerdResult<bool> {
        for &index in indices {
            let runtime = &self.runtimes[index];
            if !runtime.has_free_port(port).await? {
                debug!("Port {} is in use on {}", port, runtime.host());
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// `preferred` if free on the control node, else the next free port of the internal range
    async fn free_local_port(&mut self, preferred: u16) -> HerdResult<u16> {
        if local_port_is_free(preferred).await {
            return Ok(preferred);
        }
        let range = self.config.ports.group_port_range;
        let start = self.port_cursor.max(range.start);
        for port in start..=range.end {
            if local_port_is_free(port).await {
                self.port_cursor = port.saturating_add(1);
                return Ok(port);
            }
        }
        Err(HerdError::NoPortsLeft)
    }

    fn least_busy(&mut self) -> usize {
        self.runtimes
            .iter_mut()
            .map(Runtime::alive_task_process_count)
            .enumerate()
            .min_by_key(|&(_, count)| count)
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    fn position(&self, host: &str) -> Option<usize> {
        self.runtimes.iter().position(|runtime| runtime.host() == host)
    }

    fn position_or_err(&self, host: &str) -> HerdResult<usize> {
        self.position(host)
            .ok_or_else(|| HerdError::UnknownHost(host.to_string()))
    }

    fn select(&self, include: &[&str], exclude: &[&str]) -> HerdResult<Vec<usize>> {
        if !include.is_empty() && !exclude.is_empty() {
            return Err(HerdError::InvalidArgument(
                "either include or exclude hosts may be given, not both".to_string(),
            ));
        }
        if !include.is_empty() {
            return include.iter().map(|host| self.position_or_err(host)).collect();
        }
        Ok((0..self.runtimes.len())
            .filter(|&i| !exclude.contains(&self.runtimes[i].host()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_session::{LocalSession, MockSession};
    use std::time::Duration;

    fn test_config() -> Arc<HerdConfig> {
        let mut config = HerdConfig::default();
        config.logging.file_logging = false;
        config.runtime.tunnel_settle_delay = Duration::from_millis(5);
        Arc::new(config)
    }

    async fn mock_group(sessions: &[MockSession]) -> RuntimeGroup {
        let mut runtimes = Vec::new();
        for session in sessions {
            runtimes.push(
                Runtime::connect(Arc::new(session.clone()), None, test_config())
                    .await
                    .unwrap(),
            );
        }
        RuntimeGroup::new(runtimes).unwrap()
    }

    #[test]
    fn test_empty_group_is_rejected() {
        assert!(matches!(
            RuntimeGroup::new(Vec::new()),
            Err(HerdError::NoRuntimesDetected(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_hosts_are_rejected() {
        let a = MockSession::new("a");
        let mut group = mock_group(&[a.clone()]).await;
        let again = Runtime::connect(Arc::new(a), None, test_config()).await.unwrap();
        assert!(matches!(group.add_runtime(again), Err(HerdError::InvalidArgument(_))));
        assert_eq!(group.runtime_count(), 1);
    }

    #[tokio::test]
    async fn test_membership() {
        let mut group = mock_group(&[MockSession::new("a"), MockSession::new("b")]).await;
        assert_eq!(group.hosts(), vec!["a", "b"]);
        assert!(group.contains_runtime("b"));
        assert!(group.remove_runtime("c").is_none());
        assert_eq!(group.remove_runtime("a").map(|r| r.host().to_string()), Some("a".into()));
        assert_eq!(group.hosts(), vec!["b"]);
        assert!(matches!(group.get_runtime(Some("a")), Err(HerdError::UnknownHost(_))));
        assert!(group.get_runtimes(&["b"], &["b"]).is_err());
    }

    #[tokio::test]
    async fn test_group_free_port_checks_every_member() {
        let a = MockSession::new("a").with_busy_port(6000);
        let b = MockSession::new("b").with_busy_port(6001);
        let c = MockSession::new("c");
        let group = mock_group(&[a, b, c]).await;

        assert_eq!(group.get_free_port(&[6000, 6001, 6002], false).await.unwrap(), 6002);
        assert!(matches!(
            group.get_free_port(&[6000, 6001], false).await,
            Err(HerdError::NoPortsLeft)
        ));
        assert!(group.has_free_port(6000, &["a"]).await.unwrap());
        assert!(!group.has_free_port(6001, &["a"]).await.unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failures() {
        let ok = MockSession::new("h1").with_response("echo step", "step\n");
        let broken = MockSession::new("h2")
            .with_response("echo step", "step\n")
            .with_failure("verify-node", 3, "boom");
        let mut group = mock_group(&[ok, broken]).await;

        let task = RuntimeTask::new("fan-out")
            .run_command("echo step")
            .unwrap()
            .run_command("verify-node")
            .unwrap();
        let tasks = group
            .execute_task(&task, TaskTarget::Broadcast, ExecuteOptions::sync())
            .await
            .unwrap()
            .into_tasks();

        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].shares_state_with(&task));
        assert_eq!(tasks[1].name(), "fan-out-1");
        assert_eq!(tasks[0].execution_log(), vec!["step".to_string(), String::new()]);
        assert!(tasks[0].failure().is_none());

        let failure = tasks[1].failure().unwrap();
        assert_eq!((failure.step_index, failure.host.as_str()), (1, "h2"));
        assert!(group.join().await.is_err());
    }

    #[tokio::test]
    async fn test_least_busy_prefers_idle_member() {
        let mut runtimes = Vec::new();
        for host in ["busy", "idle"] {
            let session = Arc::new(LocalSession::named(host));
            runtimes.push(Runtime::connect(session, None, test_config()).await.unwrap());
        }
        let mut group = RuntimeGroup::new(runtimes).unwrap();

        let blocker = RuntimeTask::new("blocker").run_command("sleep 30").unwrap();
        group
            .execute_task(
                &blocker,
                TaskTarget::Host("busy".into()),
                ExecuteOptions::background().omit_on_join(true),
            )
            .await
            .unwrap();

        let next = RuntimeTask::new("next").run_command("true").unwrap();
        let task = group
            .execute_task(&next, TaskTarget::LeastBusy, ExecuteOptions::sync())
            .await
            .unwrap()
            .into_single()
            .unwrap();
        assert_eq!(task.host().as_deref(), Some("idle"));
        assert_eq!(group.task_processes().len(), 1);

        // The blocker is omitted, so joining does not wait for it
        group.join().await.unwrap();
        group.cleanup().await.unwrap();
        assert!(group.task_processes().is_empty());
    }

    #[tokio::test]
    async fn test_expose_port_to_runtimes() {
        let a = MockSession::new("a");
        let b = MockSession::new("b").with_busy_port(7100);
        let mut group = mock_group(&[a.clone(), b.clone()]).await;

        let err = group
            .expose_port_to_runtimes(5000, Some(PortCandidates::Single(7100)), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, HerdError::PortInUse { port: 7100, .. }));

        let port = group
            .expose_port_to_runtimes(5000, Some(vec![7100, 7101].into()), &[])
            .await
            .unwrap();
        assert_eq!(port, 7101);
        assert_eq!(group.tunnels().len(), 2);
        assert_eq!(a.tunnels().len(), 1);

        // Excluded hosts are neither checked nor tunneled
        let port = group
            .expose_port_to_runtimes(5001, Some(PortCandidates::Single(7100)), &["b"])
            .await
            .unwrap();
        assert_eq!(port, 7100);
        assert_eq!(b.tunnels().len(), 1);
    }

    #[tokio::test]
    async fn test_expose_port_from_runtime_to_group() {
        let a = MockSession::new("a").with_busy_port(8100);
        let b = MockSession::new("b");
        let c = MockSession::new("c");
        let mut group = mock_group(&[a.clone(), b.clone(), c.clone()]).await;

        // The source host may already use the group port itself
        let port = group
            .expose_port_from_runtime_to_group("a", 8100, None)
            .await
            .unwrap();
        assert_eq!(port, 8100);
        assert_eq!(a.tunnels().len(), 1);
        assert_eq!(b.tunnels().len(), 1);
        assert_eq!(c.tunnels().len(), 1);
        assert!(matches!(
            group.expose_port_from_runtime_to_group("z", 8100, None).await,
            Err(HerdError::UnknownHost(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_cascades_once() {
        let a = MockSession::new("a");
        let b = MockSession::new("b");
        let mut group = mock_group(&[a.clone(), b.clone()]).await;

        group.cleanup().await.unwrap();
        group.cleanup().await.unwrap();
        assert!(a.is_closed() && b.is_closed());
        let removals = a.commands().iter().filter(|c| c.starts_with("rm -rf")).count();
        assert_eq!(removals, 1);
    }

    #[tokio::test]
    async fn test_env_variables_reach_all_members() {
        let mut group = mock_group(&[MockSession::new("a"), MockSession::new("b")]).await;
        group.add_env_variables(BTreeMap::from([("K".to_string(), "v".to_string())]));
        assert!(group
            .runtimes()
            .iter()
            .all(|r| r.env_variables().get("K").map(String::as_str) == Some("v")));
    }
}
