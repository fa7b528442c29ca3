//! Runtime tasks: ordered steps executed against one session
//!
//! A task is built once and may be executed several times; each execution
//! resets its log, return values and failure. Cloning a task yields another
//! handle to the same execution state, which is how a runtime reports
//! progress of a background execution back to the caller. Independent copies
//! with fresh state come from [`RuntimeTask::duplicate`].

use herd_core::{HerdError, HerdResult, ProcessKey, TaskExecutionError};
use herd_ipc::{FileTransport, JobEnvelope, JobOutcome, JobRequest, JobResponse, JobTransport};
use herd_logging::ExecutionLogFile;
use herd_session::{shell_quote, CommandOutput, RemoteSession};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Job runner invoked for remote job steps unless the job names another one
pub const DEFAULT_JOB_RUNNER: &str = "herd-job";

/// Invocation of a pre-deployed entry point on the remote host
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteJob {
    pub entry_point: String,
    pub args: JsonValue,
    /// Command of the job runner; receives the request and response file paths
    pub runner: String,
}

impl RemoteJob {
    pub fn new(entry_point: impl Into<String>, args: JsonValue) -> Self {
        Self {
            entry_point: entry_point.into(),
            args,
            runner: DEFAULT_JOB_RUNNER.to_string(),
        }
    }

    /// Build a job from any serializable argument value
    pub fn with_args<A: Serialize>(entry_point: impl Into<String>, args: &A) -> HerdResult<Self> {
        Ok(Self::new(entry_point, serde_json::to_value(args)?))
    }

    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = runner.into();
        self
    }
}

/// One step of a task
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    RunCommand(String),
    /// `remote_path` of `None` means the file name inside the execution directory
    SendFile {
        local_path: PathBuf,
        remote_path: Option<String>,
    },
    GetFile {
        remote_path: String,
        local_path: PathBuf,
    },
    RunFunction(RemoteJob),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::RunCommand(command) => write!(f, "run `{}`", command),
            Step::SendFile {
                local_path,
                remote_path,
            } => write!(
                f,
                "send {} to {}",
                local_path.display(),
                remote_path.as_deref().unwrap_or("<working dir>")
            ),
            Step::GetFile {
                remote_path,
                local_path,
            } => write!(f, "get {} to {}", remote_path, local_path.display()),
            Step::RunFunction(job) => write!(f, "run job {}", job.entry_point),
        }
    }
}

/// Where and how a task executes
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Directory every step starts in; the session's current directory when unset
    pub working_dir: Option<String>,
    /// Environment of the runtime; task variables are layered on top
    pub env: BTreeMap<String, String>,
    /// Print step output on the control node instead of writing a log file
    pub stream_output: bool,
    /// Execution log directory; no log file is written when unset
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct ExecutionState {
    log: Vec<String>,
    returns: Vec<JsonValue>,
    failure: Option<TaskExecutionError>,
    log_file: Option<PathBuf>,
    host: Option<String>,
    process_key: Option<ProcessKey>,
    omit_on_join: bool,
    completion: Option<watch::Receiver<bool>>,
}

/// Ordered, named sequence of remote steps
#[derive(Debug, Clone)]
pub struct RuntimeTask {
    name: String,
    steps: Vec<Step>,
    env_variables: BTreeMap<String, String>,
    state: Arc<Mutex<ExecutionState>>,
}

impl RuntimeTask {
    /// Create an empty task; an empty name is replaced by a generated one
    pub fn new(name: impl Into<String>) -> Self {
        let mut name = name.into();
        if name.trim().is_empty() {
            name = generated_name();
        }
        Self {
            name,
            steps: Vec::new(),
            env_variables: BTreeMap::new(),
            state: Arc::new(Mutex::new(ExecutionState::default())),
        }
    }

    pub fn unnamed() -> Self {
        Self::new("")
    }

    pub fn run_command(mut self, command: impl Into<String>) -> HerdResult<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(HerdError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        self.steps.push(Step::RunCommand(command));
        Ok(self)
    }

    pub fn send_file(
        mut self,
        local_path: impl Into<PathBuf>,
        remote_path: Option<&str>,
    ) -> HerdResult<Self> {
        let local_path = local_path.into();
        if local_path.as_os_str().is_empty() {
            return Err(HerdError::InvalidArgument(
                "local path must not be empty".to_string(),
            ));
        }
        self.steps.push(Step::SendFile {
            local_path,
            remote_path: remote_path.filter(|p| !p.is_empty()).map(str::to_string),
        });
        Ok(self)
    }

    pub fn get_file(
        mut self,
        remote_path: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> HerdResult<Self> {
        let remote_path = remote_path.into();
        let local_path = local_path.into();
        if remote_path.is_empty() {
            return Err(HerdError::InvalidArgument(
                "remote path must not be empty".to_string(),
            ));
        }
        if local_path.as_os_str().is_empty() {
            return Err(HerdError::InvalidArgument(
                "local path must not be empty".to_string(),
            ));
        }
        self.steps.push(Step::GetFile {
            remote_path,
            local_path,
        });
        Ok(self)
    }

    pub fn run_function(mut self, job: RemoteJob) -> HerdResult<Self> {
        if job.entry_point.trim().is_empty() || job.runner.trim().is_empty() {
            return Err(HerdError::InvalidArgument(
                "remote job needs an entry point and a runner".to_string(),
            ));
        }
        self.steps.push(Step::RunFunction(job));
        Ok(self)
    }

    pub fn with_env_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_variables.insert(key.into(), value.into());
        self
    }

    pub fn with_env_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.env_variables.extend(variables);
        self
    }

    /// Let `join` return immediately for a background execution of this task
    pub fn omit_on_join(self, omit: bool) -> Self {
        self.set_omit_on_join(omit);
        self
    }

    pub fn set_omit_on_join(&self, omit: bool) {
        self.state().omit_on_join = omit;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn env_variables(&self) -> &BTreeMap<String, String> {
        &self.env_variables
    }

    pub fn is_omitted_on_join(&self) -> bool {
        self.state().omit_on_join
    }

    /// One entry per executed step; the entry of a failed step is its output
    pub fn execution_log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.state().log_file.clone()
    }

    /// Failure of the last execution
    pub fn failure(&self) -> Option<TaskExecutionError> {
        self.state().failure.clone()
    }

    /// Host of the last execution
    pub fn host(&self) -> Option<String> {
        self.state().host.clone()
    }

    /// Registry key of the background process, if executed in the background
    pub fn process_key(&self) -> Option<ProcessKey> {
        self.state().process_key.clone()
    }

    /// Whether a background execution is still in progress
    pub fn is_running(&self) -> bool {
        self.state()
            .completion
            .as_ref()
            .map(|rx| !*rx.borrow())
            .unwrap_or(false)
    }

    /// Print the execution log as `index: entry` lines
    pub fn print_log(&self) {
        for (index, entry) in self.execution_log().iter().enumerate() {
            println!("{}: {}", index, entry);
        }
    }

    /// Independent copy with fresh execution state, named `<name>-<index>`
    pub fn duplicate(&self, index: usize) -> Self {
        let copy = Self {
            name: format!("{}-{}", self.name, index),
            steps: self.steps.clone(),
            env_variables: self.env_variables.clone(),
            state: Arc::new(Mutex::new(ExecutionState::default())),
        };
        copy.set_omit_on_join(self.is_omitted_on_join());
        copy
    }

    /// Whether `other` is a handle to the same execution state
    pub fn shares_state_with(&self, other: &RuntimeTask) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Wait for a background execution to finish.
    ///
    /// Returns immediately when the task never ran in the background or is
    /// marked omit-on-join. Reports the failure of the finished execution.
    pub async fn join(&self) -> HerdResult<()> {
        let completion = {
            let state = self.state();
            if state.omit_on_join && state.process_key.is_some() {
                debug!("Skipping join of task {}", self.name);
                return Ok(());
            }
            state.completion.clone()
        };

        if let Some(mut rx) = completion {
            // A closed channel means the execution was stopped
            let _ = rx.wait_for(|finished| *finished).await;
        }

        match self.failure() {
            Some(failure) => Err(HerdError::TaskExecution(failure)),
            None => Ok(()),
        }
    }

    /// Return values of the function steps, after waiting for the execution
    pub async fn function_returns(&self) -> HerdResult<FunctionReturns> {
        self.join().await?;
        Ok(FunctionReturns::new(self.state().returns.clone()))
    }

    /// Mark the task as running in the background under `key`
    pub(crate) fn begin_background(&self, key: ProcessKey) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        let mut state = self.state();
        state.process_key = Some(key);
        state.completion = Some(rx);
        tx
    }

    /// Forget an earlier background execution before running in the caller's flow
    pub(crate) fn begin_foreground(&self) {
        let mut state = self.state();
        state.process_key = None;
        state.completion = None;
    }

    /// Run every step in order against `session`
    pub async fn execute(
        &self,
        session: &dyn RemoteSession,
        context: &ExecutionContext,
    ) -> HerdResult<()> {
        let host = session.host().to_string();
        {
            let mut state = self.state();
            state.log.clear();
            state.returns.clear();
            state.failure = None;
            state.log_file = None;
            state.host = Some(host.clone());
        }
        info!("Executing task {} on {}", self.name, host);

        let mut env = context.env.clone();
        env.extend(self.env_variables.clone());

        let working_dir = match &context.working_dir {
            Some(dir) => dir.clone(),
            None => match session.run("pwd", None, &env).await {
                Ok(output) if output.success() => output.stdout_trimmed().to_string(),
                Ok(output) => return Err(self.fail(0, &host, output.combined(), None)),
                Err(e) => return Err(self.fail(0, &host, String::new(), Some(e.to_string()))),
            },
        };

        let log_file = match (&context.log_dir, context.stream_output) {
            (Some(dir), false) => match ExecutionLogFile::create(dir, &host, &self.name).await {
                Ok(file) => {
                    self.state().log_file = Some(file.path().to_path_buf());
                    Some(file)
                }
                Err(e) => {
                    warn!("Could not create execution log for task {}: {}", self.name, e);
                    None
                }
            },
            _ => None,
        };

        let run = StepRun {
            session,
            host: &host,
            working_dir: &working_dir,
            env: &env,
            stream_output: context.stream_output,
            log_file: log_file.as_ref(),
        };

        for (index, step) in self.steps.iter().enumerate() {
            debug!("Task {} step {}: {}", self.name, index, step);
            match run.step(index, step).await {
                Ok(StepResult { output, value }) => {
                    let mut state = self.state();
                    state.log.push(output);
                    if let Some(value) = value {
                        state.returns.push(value);
                    }
                }
                Err(StepFailure { output, cause }) => {
                    self.state().log.push(output.clone());
                    return Err(self.fail(index, &host, output, cause));
                }
            }
        }

        info!("Task {} finished on {}", self.name, host);
        Ok(())
    }

    fn fail(
        &self,
        step_index: usize,
        host: &str,
        output: String,
        cause: Option<String>,
    ) -> HerdError {
        let mut failure = TaskExecutionError::new(&self.name, step_index, host, output)
            .with_log_file(self.log_file_path());
        if let Some(cause) = cause {
            failure = failure.with_cause(cause);
        }
        warn!(
            "Task {} failed on {} in step {}",
            self.name, host, step_index
        );
        self.state().failure = Some(failure.clone());
        HerdError::TaskExecution(failure)
    }

    fn state(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Return values of function steps in call order.
///
/// Consumed once; the values were materialized when the steps ran.
#[derive(Debug)]
pub struct FunctionReturns {
    values: std::vec::IntoIter<JsonValue>,
}

impl FunctionReturns {
    pub(crate) fn new(values: Vec<JsonValue>) -> Self {
        Self {
            values: values.into_iter(),
        }
    }

    /// Decode every remaining value into `T`
    pub fn decode<T: DeserializeOwned>(self) -> impl Iterator<Item = HerdResult<T>> {
        self.values
            .map(|value| serde_json::from_value(value).map_err(HerdError::from))
    }
}

impl Iterator for FunctionReturns {
    type Item = JsonValue;

    fn next(&mut self) -> Option<Self::Item> {
        self.values.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.values.size_hint()
    }
}

impl ExactSizeIterator for FunctionReturns {}

impl Extend<JsonValue> for FunctionReturns {
    fn extend<I: IntoIterator<Item = JsonValue>>(&mut self, iter: I) {
        let mut values: Vec<JsonValue> = self.values.by_ref().collect();
        values.extend(iter);
        self.values = values.into_iter();
    }
}

struct StepResult {
    output: String,
    value: Option<JsonValue>,
}

struct StepFailure {
    output: String,
    cause: Option<String>,
}

impl StepFailure {
    fn caused_by(error: impl fmt::Display) -> Self {
        Self {
            output: String::new(),
            cause: Some(error.to_string()),
        }
    }
}

/// Everything a single step needs from the surrounding execution
struct StepRun<'a> {
    session: &'a dyn RemoteSession,
    host: &'a str,
    working_dir: &'a str,
    env: &'a BTreeMap<String, String>,
    stream_output: bool,
    log_file: Option<&'a ExecutionLogFile>,
}

impl StepRun<'_> {
    async fn step(&self, index: usize, step: &Step) -> Result<StepResult, StepFailure> {
        match step {
            Step::RunCommand(command) => {
                let output = self.command(index, command).await?;
                Ok(StepResult {
                    output,
                    value: None,
                })
            }
            Step::SendFile {
                local_path,
                remote_path,
            } => {
                let remote = resolve_send_path(self.working_dir, local_path, remote_path.as_deref());
                self.session
                    .upload(local_path, &remote)
                    .await
                    .map_err(StepFailure::caused_by)?;
                self.record(index, &step.to_string(), "").await;
                Ok(StepResult {
                    output: String::new(),
                    value: None,
                })
            }
            Step::GetFile {
                remote_path,
                local_path,
            } => {
                let remote = resolve_remote_path(self.working_dir, remote_path);
                self.session
                    .download(&remote, local_path)
                    .await
                    .map_err(StepFailure::caused_by)?;
                self.record(index, &step.to_string(), "").await;
                Ok(StepResult {
                    output: String::new(),
                    value: None,
                })
            }
            Step::RunFunction(job) => self.job(index, job).await,
        }
    }

    /// Run a shell command in the working directory
    async fn command(&self, index: usize, command: &str) -> Result<String, StepFailure> {
        let output = self
            .session
            .run(command, Some(self.working_dir), self.env)
            .await
            .map_err(StepFailure::caused_by)?;
        self.report(index, command, &output).await;

        if output.success() {
            Ok(output.stdout_trimmed().to_string())
        } else {
            Err(StepFailure {
                output: output.combined(),
                cause: Some(format!("exit code {}", output.exit_code)),
            })
        }
    }

    /// Ship the request, invoke the runner, fetch and decode the response
    async fn job(&self, index: usize, job: &RemoteJob) -> Result<StepResult, StepFailure> {
        let scratch = tempfile::tempdir().map_err(StepFailure::caused_by)?;
        let id = Uuid::new_v4().simple().to_string();
        let local_request = scratch.path().join("request.json");
        let local_response = scratch.path().join("response.json");
        let remote_request = join_remote(self.working_dir, &format!(".herd-job-{}-request.json", id));
        let remote_response = join_remote(self.working_dir, &format!(".herd-job-{}-response.json", id));

        let request = JobRequest::new(&job.entry_point, job.args.clone());
        FileTransport::new(&local_request)
            .send(&JobEnvelope::new(request))
            .await
            .map_err(StepFailure::caused_by)?;

        self.session
            .upload(&local_request, &remote_request)
            .await
            .map_err(StepFailure::caused_by)?;

        let invoke = format!(
            "{} {} {}",
            job.runner,
            shell_quote(&remote_request),
            shell_quote(&remote_response)
        );
        let result = self.command(index, &invoke).await;
        let fetched = match &result {
            Ok(_) => self
                .session
                .download(&remote_response, &local_response)
                .await
                .map_err(StepFailure::caused_by),
            Err(_) => Ok(()),
        };

        let cleanup = format!(
            "rm -f {} {}",
            shell_quote(&remote_request),
            shell_quote(&remote_response)
        );
        if let Err(e) = self.session.run(&cleanup, Some(self.working_dir), self.env).await {
            warn!("Could not remove job files on {}: {}", self.host, e);
        }

        let output = result?;
        fetched?;

        let response: JobEnvelope<JobResponse> = FileTransport::new(&local_response)
            .receive()
            .await
            .map_err(StepFailure::caused_by)?;
        match response.message.outcome {
            JobOutcome::Success { value } => Ok(StepResult {
                output,
                value: Some(value),
            }),
            JobOutcome::Failure { error } => Err(StepFailure {
                output: error,
                cause: Some(format!("entry point {} failed", job.entry_point)),
            }),
        }
    }

    async fn report(&self, index: usize, label: &str, output: &CommandOutput) {
        if self.stream_output {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
        }
        self.record(index, label, &output.combined()).await;
    }

    async fn record(&self, index: usize, label: &str, output: &str) {
        if let Some(log_file) = self.log_file {
            if let Err(e) = log_file.append_step(index, label, output).await {
                warn!("Could not write execution log {}: {}", log_file.path().display(), e);
            }
        }
    }
}

/// Remote destination of a sent file.
///
/// No path means the file name inside `working_dir`; relative paths are
/// taken relative to `working_dir`.
pub(crate) fn resolve_send_path(working_dir: &str, local_path: &Path, remote_path: Option<&str>) -> String {
    match remote_path {
        None => {
            let file_name = local_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            join_remote(working_dir, &file_name)
        }
        Some(path) => resolve_remote_path(working_dir, path),
    }
}

/// Absolute remote paths stay as they are; relative ones live under `working_dir`
pub(crate) fn resolve_remote_path(working_dir: &str, remote_path: &str) -> String {
    if remote_path.starts_with('/') || remote_path.starts_with('~') {
        remote_path.to_string()
    } else {
        join_remote(working_dir, remote_path.trim_start_matches("./"))
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn generated_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("task-{}", &id[..8])
}
