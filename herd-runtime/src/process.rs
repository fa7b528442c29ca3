//! Background processes owned by a runtime

use chrono::{DateTime, Utc};
use herd_core::{HerdError, HerdResult, ProcessKey, ProcessKind};
use herd_resilience::ProcessShutdownManager;
use herd_session::Tunnel;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What actually runs behind a process handle
#[derive(Debug)]
pub enum ProcessBackend {
    /// An OS process spawned on the control node
    Child(Child),
    /// A task on the tokio runtime (background task execution, local relays)
    Task(JoinHandle<()>),
}

/// One background process together with its registry key
#[derive(Debug)]
pub struct ProcessHandle {
    key: ProcessKey,
    kind: ProcessKind,
    backend: ProcessBackend,
    started_at: DateTime<Utc>,
    stopped: bool,
}

impl ProcessHandle {
    pub fn new(key: ProcessKey, kind: ProcessKind, backend: ProcessBackend) -> Self {
        Self {
            key,
            kind,
            backend,
            started_at: Utc::now(),
            stopped: false,
        }
    }

    /// Handle for a task running in the background
    pub fn task(key: ProcessKey, handle: JoinHandle<()>) -> Self {
        Self::new(key, ProcessKind::Task, ProcessBackend::Task(handle))
    }

    /// Handle for an open tunnel
    pub fn tunnel(key: ProcessKey, tunnel: Tunnel) -> Self {
        let backend = match tunnel {
            Tunnel::Process(child) => ProcessBackend::Child(child),
            Tunnel::Relay(handle) => ProcessBackend::Task(handle),
        };
        Self::new(key, ProcessKind::Tunnel, backend)
    }

    pub fn key(&self) -> &ProcessKey {
        &self.key
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// OS process id, if backed by a child process that still runs
    pub fn pid(&self) -> Option<u32> {
        match &self.backend {
            ProcessBackend::Child(child) => child.id(),
            ProcessBackend::Task(_) => None,
        }
    }

    pub fn is_alive(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        match &mut self.backend {
            ProcessBackend::Child(child) => matches!(child.try_wait(), Ok(None)),
            ProcessBackend::Task(handle) => !handle.is_finished(),
        }
    }

    /// Terminate the process; stopping twice is a no-op
    pub async fn stop(&mut self, grace_period: Duration) -> HerdResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        debug!("Stopping process {}", self.key);

        match &mut self.backend {
            ProcessBackend::Child(child) => {
                ProcessShutdownManager::shutdown_process(child, grace_period)
                    .await
                    .map_err(|e| HerdError::Session(format!("failed to stop {}: {}", self.key, e)))?;
            }
            ProcessBackend::Task(handle) => {
                handle.abort();
                // Cancellation surfaces as a join error
                let _ = handle.await;
            }
        }
        Ok(())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // Child processes are spawned with kill_on_drop; tasks need an explicit abort
        if let ProcessBackend::Task(handle) = &self.backend {
            handle.abort();
        }
    }
}

/// Process handles of one runtime, keyed by process key
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: BTreeMap<ProcessKey, ProcessHandle>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle; a live handle under the same key is never replaced
    pub fn insert(&mut self, handle: ProcessHandle) -> HerdResult<()> {
        if let Some(existing) = self.processes.get_mut(handle.key()) {
            if existing.is_alive() {
                return Err(HerdError::InvalidArgument(format!(
                    "process key {} is already in use",
                    handle.key()
                )));
            }
        }
        self.processes.insert(handle.key().clone(), handle);
        Ok(())
    }

    pub fn get(&self, key: &ProcessKey) -> Option<&ProcessHandle> {
        self.processes.get(key)
    }

    pub fn contains_alive(&mut self, key: &ProcessKey) -> bool {
        self.processes
            .get_mut(key)
            .map(|handle| handle.is_alive())
            .unwrap_or(false)
    }

    /// Keys in key order, optionally only of processes that still run
    pub fn keys(&mut self, only_alive: bool) -> Vec<ProcessKey> {
        self.processes
            .iter_mut()
            .filter_map(|(key, handle)| (!only_alive || handle.is_alive()).then(|| key.clone()))
            .collect()
    }

    pub fn alive_count(&mut self, kind: Option<ProcessKind>) -> usize {
        self.processes
            .values_mut()
            .filter(|handle| kind.map_or(true, |k| handle.kind() == k))
            .map(|handle| handle.is_alive())
            .filter(|alive| *alive)
            .count()
    }

    /// Stop and remove one process
    pub async fn stop(&mut self, key: &ProcessKey, grace_period: Duration) -> HerdResult<()> {
        let mut handle = self
            .processes
            .remove(key)
            .ok_or_else(|| HerdError::UnknownProcess(key.to_string()))?;
        handle.stop(grace_period).await
    }

    /// Stop and remove every process, reporting the first failure
    pub async fn stop_all(&mut self, grace_period: Duration) -> HerdResult<()> {
        let mut first_error = None;
        let processes = std::mem::take(&mut self.processes);
        for (key, mut handle) in processes {
            if let Err(e) = handle.stop(grace_period).await {
                warn!("Failed to stop process {}: {}", key, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
