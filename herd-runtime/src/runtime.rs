//! A single runtime host
//!
//! A [`Runtime`] owns the session to its host, a working directory, the
//! environment every task sees and the registry of background processes it
//! started. All remote paths of a runtime resolve against its working
//! directory.

use futures::future::join_all;
use herd_config::HerdConfig;
use herd_core::{
    local_port_is_free, HerdError, HerdResult, PortScope, ProcessKey, ProcessKind, LOCALHOST,
};
use herd_session::{
    shell_quote, CommandOutput, HostFacts, HostFilter, LocalSession, RemoteSession, SshSession,
    TunnelSpec,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::process::{ProcessHandle, ProcessRegistry};
use crate::task::{ExecutionContext, FunctionReturns, RemoteJob, RuntimeTask};

/// How a task is executed on a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Run in a background process instead of the caller's flow
    pub asynchronous: bool,
    /// Let `join` skip the task; for processes that never return
    pub omit_on_join: bool,
    /// Print output on the control node instead of writing a log file
    pub stream_output: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            asynchronous: true,
            omit_on_join: false,
            stream_output: false,
        }
    }
}

impl ExecuteOptions {
    /// Execute in the caller's flow
    pub fn sync() -> Self {
        Self {
            asynchronous: false,
            ..Default::default()
        }
    }

    pub fn background() -> Self {
        Self::default()
    }

    pub fn omit_on_join(mut self, omit: bool) -> Self {
        self.omit_on_join = omit;
        self
    }

    pub fn stream_output(mut self, stream: bool) -> Self {
        self.stream_output = stream;
        self
    }
}

/// The control node's handle to one host
#[derive(Debug)]
pub struct Runtime {
    host: String,
    session: Arc<dyn RemoteSession>,
    config: Arc<HerdConfig>,
    working_dir: String,
    owns_working_dir: bool,
    env_variables: BTreeMap<String, String>,
    processes: ProcessRegistry,
    tasks: Vec<RuntimeTask>,
    task_sequence: u64,
    cleaned_up: bool,
}

impl Runtime {
    /// Validate `session` and prepare the working directory.
    ///
    /// Without `working_dir` a temporary directory is created and removed
    /// again on cleanup; a supplied directory is created if missing and left
    /// in place.
    pub async fn connect(
        session: Arc<dyn RemoteSession>,
        working_dir: Option<&str>,
        config: Arc<HerdConfig>,
    ) -> HerdResult<Self> {
        let host = session.host().to_string();
        let invalid = |cause: String| HerdError::InvalidRuntime {
            host: host.clone(),
            cause,
        };

        session.connect().await.map_err(|e| invalid(e.to_string()))?;
        let validation = session
            .run(&config.runtime.validation_command, None, &BTreeMap::new())
            .await
            .map_err(|e| invalid(e.to_string()))?;
        if !validation.success() {
            return Err(invalid(format!(
                "`{}` exited with {}: {}",
                config.runtime.validation_command,
                validation.exit_code,
                validation.combined().trim()
            )));
        }

        let mut runtime = Self {
            host: host.clone(),
            session,
            config,
            working_dir: String::new(),
            owns_working_dir: working_dir.is_none(),
            env_variables: BTreeMap::new(),
            processes: ProcessRegistry::new(),
            tasks: Vec::new(),
            task_sequence: 0,
            cleaned_up: false,
        };

        runtime.working_dir = match working_dir {
            Some(dir) => {
                runtime.create_dir(dir).await?;
                dir.to_string()
            }
            None => runtime.create_tempdir().await?,
        };
        runtime.insert_working_dir_variable();

        info!(
            "Runtime {} ready with working directory {}",
            runtime.host, runtime.working_dir
        );
        Ok(runtime)
    }

    /// Runtime reached through the system ssh client
    pub async fn ssh(
        host: impl Into<String>,
        working_dir: Option<&str>,
        config: Arc<HerdConfig>,
    ) -> HerdResult<Self> {
        let session = SshSession::new(host, config.runtime.ssh.clone());
        Self::connect(Arc::new(session), working_dir, config).await
    }

    /// Runtime on the control node itself
    pub async fn local(working_dir: Option<&str>, config: Arc<HerdConfig>) -> HerdResult<Self> {
        Self::connect(Arc::new(LocalSession::new()), working_dir, config).await
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    /// Whether the working directory is removed on cleanup
    pub fn owns_working_dir(&self) -> bool {
        self.owns_working_dir
    }

    pub fn env_variables(&self) -> &BTreeMap<String, String> {
        &self.env_variables
    }

    pub fn session(&self) -> Arc<dyn RemoteSession> {
        Arc::clone(&self.session)
    }

    pub fn config(&self) -> &Arc<HerdConfig> {
        &self.config
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    /// Execute `task` here, in the background unless `options` say otherwise.
    ///
    /// A synchronous execution returns the task's failure directly. A
    /// background execution registers a task process and reports failures
    /// through [`RuntimeTask::join`].
    pub async fn execute_task(&mut self, task: &RuntimeTask, options: ExecuteOptions) -> HerdResult<()> {
        self.ensure_active()?;
        if options.omit_on_join {
            task.set_omit_on_join(true);
        }
        let context = self.execution_context(options.stream_output);
        self.tasks.push(task.clone());

        if !options.asynchronous {
            task.begin_foreground();
            return task.execute(self.session.as_ref(), &context).await;
        }

        self.task_sequence += 1;
        let key = ProcessKey::task(&self.host, task.name(), self.task_sequence);
        let done = task.begin_background(key.clone());
        let session = Arc::clone(&self.session);
        let background = task.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = background.execute(session.as_ref(), &context).await {
                debug!("Background task {} failed: {}", background.name(), e);
            }
            let _ = done.send(true);
        });

        debug!("Started task process {}", key);
        self.processes.insert(ProcessHandle::task(key, handle))
    }

    /// Send a local file or directory to the runtime, synchronously
    pub async fn send_file(&mut self, local_path: impl Into<PathBuf>, remote_path: Option<&str>) -> HerdResult<()> {
        let local_path = local_path.into();
        let task = RuntimeTask::new(format!("send-{}", file_label(&local_path)))
            .send_file(local_path, remote_path)?;
        self.execute_task(&task, ExecuteOptions::sync()).await
    }

    /// Fetch a remote file or directory, synchronously
    pub async fn get_file(&mut self, remote_path: &str, local_path: impl Into<PathBuf>) -> HerdResult<()> {
        let task = RuntimeTask::new(format!("get-{}", file_label(Path::new(remote_path))))
            .get_file(remote_path, local_path)?;
        self.execute_task(&task, ExecuteOptions::sync()).await
    }

    /// Run a single remote job and hand back its task for the return value
    pub async fn execute_function(&mut self, job: RemoteJob, options: ExecuteOptions) -> HerdResult<RuntimeTask> {
        let task = RuntimeTask::new(format!("function-{}", job.entry_point)).run_function(job)?;
        self.execute_task(&task, options).await?;
        Ok(task)
    }

    /// Echo `message` through the runtime's shell
    pub async fn echo(&self, message: &str) -> HerdResult<String> {
        let output = self.run_checked(&format!("echo {}", shell_quote(message))).await?;
        Ok(output.stdout_trimmed().to_string())
    }

    /// Run a single command in the working directory with the runtime's environment
    pub async fn run_command(&self, command: &str) -> HerdResult<CommandOutput> {
        Ok(self
            .session
            .run(command, Some(&self.working_dir), &self.env_variables)
            .await?)
    }

    /// Hardware and software facts of the host
    pub async fn info(&self) -> HerdResult<HostFacts> {
        Ok(HostFacts::collect(self.session.as_ref()).await?)
    }

    /// Whether the host meets `filter`
    pub async fn check_filter(&self, filter: &HostFilter) -> HerdResult<bool> {
        Ok(filter.matches(self.session.as_ref()).await?)
    }

    /// First candidate that is not bound on the host, in candidate order
    pub async fn get_free_port(&self, candidates: &[u16]) -> HerdResult<u16> {
        if candidates.is_empty() {
            return Err(HerdError::InvalidArgument(
                "port candidate list is empty".to_string(),
            ));
        }
        for &port in candidates {
            if self.has_free_port(port).await? {
                debug!("Port {} is free on {}", port, self.host);
                return Ok(port);
            }
        }
        Err(HerdError::NoPortsLeft)
    }

    pub async fn has_free_port(&self, port: u16) -> HerdResult<bool> {
        Ok(self.session.is_port_free(port).await?)
    }

    /// Make `local_port` of the control node reachable as `runtime_port` on the host.
    ///
    /// Returns `None` when nothing has to be forwarded, i.e. the runtime is
    /// the control node and both ports are equal.
    pub async fn expose_port_to_runtime(
        &mut self,
        local_port: u16,
        runtime_port: Option<u16>,
    ) -> HerdResult<Option<ProcessKey>> {
        self.ensure_active()?;
        let runtime_port = runtime_port.unwrap_or(local_port);
        if self.host == LOCALHOST && runtime_port == local_port {
            return Ok(None);
        }
        if !self.has_free_port(runtime_port).await? {
            return Err(HerdError::PortInUse {
                port: runtime_port,
                scope: PortScope::Runtime(self.host.clone()),
            });
        }

        let key = ProcessKey::to_runtime(&self.host, runtime_port, local_port);
        let spec = TunnelSpec::ToRuntime {
            local_port,
            runtime_port,
        };
        self.open_tunnel(key, spec).await.map(Some)
    }

    /// Make `runtime_port` of the host reachable as `local_port` on the control node
    pub async fn expose_port_from_runtime(
        &mut self,
        runtime_port: u16,
        local_port: Option<u16>,
    ) -> HerdResult<Option<ProcessKey>> {
        self.ensure_active()?;
        let local_port = local_port.unwrap_or(runtime_port);
        if self.host == LOCALHOST && runtime_port == local_port {
            return Ok(None);
        }
        if !local_port_is_free(local_port).await {
            return Err(HerdError::PortInUse {
                port: local_port,
                scope: PortScope::Local,
            });
        }

        let key = ProcessKey::from_runtime(&self.host, local_port, runtime_port);
        let spec = TunnelSpec::FromRuntime {
            runtime_port,
            local_port,
        };
        self.open_tunnel(key, spec).await.map(Some)
    }

    async fn open_tunnel(&mut self, key: ProcessKey, spec: TunnelSpec) -> HerdResult<ProcessKey> {
        let tunnel = self.session.open_tunnel(spec).await?;
        let mut handle = ProcessHandle::tunnel(key.clone(), tunnel);

        tokio::time::sleep(self.config.runtime.tunnel_settle_delay).await;
        if !handle.is_alive() {
            return Err(HerdError::Session(format!(
                "tunnel {} on {} exited right after start",
                spec, self.host
            )));
        }

        info!("Opened tunnel {} on {}", spec, self.host);
        self.processes.insert(handle)?;
        Ok(key)
    }

    pub fn get_process(&self, key: &ProcessKey) -> Option<&ProcessHandle> {
        self.processes.get(key)
    }

    pub fn process_keys(&mut self, only_alive: bool) -> Vec<ProcessKey> {
        self.processes.keys(only_alive)
    }

    /// Terminate one task or tunnel process
    pub async fn stop_process(&mut self, key: &ProcessKey) -> HerdResult<()> {
        self.processes
            .stop(key, self.config.runtime.stop_grace_period)
            .await
    }

    /// Stop every task and tunnel process but keep the runtime usable
    pub async fn stop_all_processes(&mut self) -> HerdResult<()> {
        self.processes
            .stop_all(self.config.runtime.stop_grace_period)
            .await
    }

    pub fn alive_process_count(&mut self) -> usize {
        self.processes.alive_count(None)
    }

    pub fn alive_task_process_count(&mut self) -> usize {
        self.processes.alive_count(Some(ProcessKind::Task))
    }

    /// Create a fresh temporary directory on the host
    pub async fn create_tempdir(&self) -> HerdResult<String> {
        let output = self.session.run("mktemp -d", None, &BTreeMap::new()).await?;
        let dir = output.stdout_trimmed();
        if !output.success() || dir.is_empty() {
            return Err(HerdError::PathCreation {
                path: "<temporary directory>".to_string(),
                host: self.host.clone(),
            });
        }
        Ok(dir.to_string())
    }

    /// Create `path` with all missing parents
    pub async fn create_dir(&self, path: &str) -> HerdResult<()> {
        let output = self
            .session
            .run(&format!("mkdir -p {}", shell_quote(path)), None, &BTreeMap::new())
            .await?;
        if !output.success() {
            return Err(HerdError::PathCreation {
                path: path.to_string(),
                host: self.host.clone(),
            });
        }
        Ok(())
    }

    /// Remove `path` recursively; false when the host reported a failure
    pub async fn delete_dir(&self, path: &str) -> HerdResult<bool> {
        let output = self
            .session
            .run(&format!("rm -rf {}", shell_quote(path)), None, &BTreeMap::new())
            .await?;
        if !output.success() {
            warn!("Could not delete {} on {}: {}", path, self.host, output.combined().trim());
        }
        Ok(output.success())
    }

    /// Replace the environment; the working directory variable is kept
    pub fn set_env_variables(&mut self, variables: BTreeMap<String, String>) {
        self.env_variables = variables;
        self.insert_working_dir_variable();
    }

    pub fn add_env_variables(&mut self, variables: BTreeMap<String, String>) {
        self.env_variables.extend(variables);
        self.insert_working_dir_variable();
    }

    /// Wait for every task executed on this runtime
    pub async fn join(&self) -> HerdResult<()> {
        let results = join_all(self.tasks.iter().map(|task| task.join())).await;
        results.into_iter().collect::<HerdResult<Vec<()>>>()?;
        Ok(())
    }

    /// Tasks executed on this runtime, in execution order
    pub fn tasks(&self) -> &[RuntimeTask] {
        &self.tasks
    }

    pub fn clear_tasks(&mut self) {
        self.tasks.clear();
    }

    /// Log of the most recent task named `task_name`
    pub fn execution_log(&self, task_name: &str) -> Option<Vec<String>> {
        self.find_task(task_name).map(RuntimeTask::execution_log)
    }

    /// Print the logs of all tasks, or only of the tasks named `task_name`
    pub fn print_log(&self, task_name: Option<&str>) {
        for task in &self.tasks {
            if task_name.is_some_and(|name| name != task.name()) {
                continue;
            }
            println!("{} ({}):", task.name(), self.host);
            task.print_log();
        }
    }

    /// Return values of the most recent task named `task_name`
    pub async fn function_returns(&self, task_name: &str) -> HerdResult<FunctionReturns> {
        let task = self.find_task(task_name).ok_or_else(|| {
            HerdError::InvalidArgument(format!("no task {} on runtime {}", task_name, self.host))
        })?;
        task.function_returns().await
    }

    /// Stop every process, remove an owned working directory and close the session.
    ///
    /// Calling it again does nothing.
    pub async fn cleanup(&mut self) -> HerdResult<()> {
        if self.cleaned_up {
            return Ok(());
        }
        self.cleaned_up = true;
        info!("Cleaning up runtime {}", self.host);

        let mut first_error = self.stop_all_processes().await.err();

        if self.owns_working_dir {
            match self.delete_dir(&self.working_dir).await {
                Ok(true) => debug!("Removed {} on {}", self.working_dir, self.host),
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.session.close().await {
            first_error.get_or_insert(e.into());
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn execution_context(&self, stream_output: bool) -> ExecutionContext {
        let logging = &self.config.logging;
        ExecutionContext {
            working_dir: Some(self.working_dir.clone()),
            env: self.env_variables.clone(),
            stream_output,
            log_dir: logging
                .file_logging
                .then(|| logging.execution_log_directory()),
        }
    }

    fn insert_working_dir_variable(&mut self) {
        self.env_variables.insert(
            self.config.runtime.working_dir_env_var.clone(),
            self.working_dir.clone(),
        );
    }

    fn find_task(&self, task_name: &str) -> Option<&RuntimeTask> {
        self.tasks.iter().rev().find(|task| task.name() == task_name)
    }

    async fn run_checked(&self, command: &str) -> HerdResult<CommandOutput> {
        let output = self.run_command(command).await?;
        if !output.success() {
            return Err(HerdError::Session(format!(
                "`{}` failed on {}: {}",
                command,
                self.host,
                output.combined().trim()
            )));
        }
        Ok(output)
    }

    fn ensure_active(&self) -> HerdResult<()> {
        if self.cleaned_up {
            return Err(HerdError::InvalidArgument(format!(
                "runtime {} was cleaned up",
                self.host
            )));
        }
        Ok(())
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}
