//! Master/worker cluster state machine
//!
//! ```text
//! NotStarted -> MasterStarting -> MasterReady -> WorkersStarting -> Running
//!                     |                               |
//!                     +------------> Failed <---------+
//! any state -> CleaningUp -> Stopped
//! ```
//!
//! A failed or stopped cluster is started again only after `cleanup`.

use herd_core::{HerdError, HerdResult, PortCandidates};
use herd_runtime::RuntimeGroup;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::launcher::{MasterLauncher, WorkerLauncher};

/// Phase of a cluster bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterPhase {
    NotStarted,
    MasterStarting,
    MasterReady,
    WorkersStarting,
    Running,
    CleaningUp,
    Stopped,
    Failed,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterPhase::NotStarted => "not started",
            ClusterPhase::MasterStarting => "master starting",
            ClusterPhase::MasterReady => "master ready",
            ClusterPhase::WorkersStarting => "workers starting",
            ClusterPhase::Running => "running",
            ClusterPhase::CleaningUp => "cleaning up",
            ClusterPhase::Stopped => "stopped",
            ClusterPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Cluster of one master and several workers on a runtime group
#[derive(Debug)]
pub struct MasterWorkerCluster {
    group: RuntimeGroup,
    master: Box<dyn MasterLauncher>,
    workers: Box<dyn WorkerLauncher>,
    ports: Vec<u16>,
    default_master_port: u16,
    master_timeout: Duration,
    phase: ClusterPhase,
}

impl MasterWorkerCluster {
    /// Cluster with port candidates, master port and timeout from the group's configuration
    pub fn new(group: RuntimeGroup, master: Box<dyn MasterLauncher>, workers: Box<dyn WorkerLauncher>) -> Self {
        let config = std::sync::Arc::clone(group.config());
        Self {
            group,
            master,
            workers,
            ports: config.ports.cluster_port_range.to_vec(),
            default_master_port: config.ports.default_master_port,
            master_timeout: config.cluster.master_start_timeout,
            phase: ClusterPhase::NotStarted,
        }
    }

    /// Candidate ports for the master fallback and the workers
    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    /// Port tried for the master when none is requested
    pub fn with_default_master_port(mut self, port: u16) -> Self {
        self.default_master_port = port;
        self
    }

    pub fn with_master_timeout(mut self, timeout: Duration) -> Self {
        self.master_timeout = timeout;
        self
    }

    pub fn phase(&self) -> ClusterPhase {
        self.phase
    }

    pub fn master_port(&self) -> Option<u16> {
        self.master.port()
    }

    pub fn master_launcher(&self) -> &dyn MasterLauncher {
        self.master.as_ref()
    }

    pub fn worker_ports_per_host(&self) -> &BTreeMap<String, Vec<u16>> {
        self.workers.ports_per_host()
    }

    /// Candidate ports not consumed yet
    pub fn remaining_ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn runtime_group(&self) -> &RuntimeGroup {
        &self.group
    }

    pub fn runtime_group_mut(&mut self) -> &mut RuntimeGroup {
        &mut self.group
    }

    /// Start the master, then the workers
    pub async fn start(&mut self, worker_count: Option<usize>, master_port: Option<u16>) -> HerdResult<()> {
        info!("Starting the cluster");
        self.start_master(master_port).await?;
        self.start_workers(worker_count).await
    }

    /// Start the master and wait until it is ready.
    ///
    /// Without `master_port` the default master port is used if it is free
    /// in the group, else the first free candidate port.
    pub async fn start_master(&mut self, master_port: Option<u16>) -> HerdResult<()> {
        self.expect_phase(&[ClusterPhase::NotStarted, ClusterPhase::Stopped])?;
        self.phase = ClusterPhase::MasterStarting;

        let (candidates, from_list) = match master_port {
            Some(port) => (PortCandidates::Single(port), false),
            None => match self.group.has_free_port(self.default_master_port, &[]).await {
                Ok(true) => (PortCandidates::Single(self.default_master_port), false),
                Ok(false) => (PortCandidates::List(self.ports.clone()), true),
                Err(e) => return self.fail(e),
            },
        };

        match self
            .master
            .start(&mut self.group, candidates, self.master_timeout)
            .await
        {
            Ok(launch) => {
                if from_list {
                    self.ports = launch.remaining_ports;
                }
                if self.master.process().is_none() {
                    debug!("Master runs without a process handle; it is stopped by its launcher");
                }
                self.phase = ClusterPhase::MasterReady;
                info!("Master started on port {}", launch.port);
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Start `count` workers, one per runtime by default
    pub async fn start_workers(&mut self, count: Option<usize>) -> HerdResult<()> {
        self.expect_phase(&[ClusterPhase::MasterReady])?;
        let master_port = self.master.port().ok_or_else(|| HerdError::InvalidClusterState {
            expected: "a master with a port".to_string(),
            actual: self.phase.to_string(),
        })?;
        let count = count.unwrap_or_else(|| self.group.runtime_count());
        self.phase = ClusterPhase::WorkersStarting;

        match self
            .workers
            .start(&mut self.group, count, master_port, self.ports.clone())
            .await
        {
            Ok(remaining) => {
                self.ports = remaining;
                self.phase = ClusterPhase::Running;
                info!("{} worker(s) started", count);
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Stop workers, master and every process and tunnel of the group.
    ///
    /// Valid in every phase; the runtimes stay usable for another start.
    pub async fn cleanup(&mut self) -> HerdResult<()> {
        if self.phase == ClusterPhase::Stopped {
            return Ok(());
        }
        info!("Shutting down the cluster ({})", self.phase);
        self.phase = ClusterPhase::CleaningUp;

        let mut first_error = None;
        if let Err(e) = self.workers.cleanup(&mut self.group).await {
            warn!("Worker cleanup failed: {}", e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.master.cleanup(&mut self.group).await {
            warn!("Master cleanup failed: {}", e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.group.stop_all_processes().await {
            first_error.get_or_insert(e);
        }
        self.group.clear_tasks();

        self.phase = ClusterPhase::Stopped;
        first_error.map_or(Ok(()), Err)
    }

    /// Clean up the cluster and release the whole runtime group
    pub async fn shutdown(mut self) -> HerdResult<()> {
        let cluster_result = self.cleanup().await;
        let group_result = self.group.cleanup().await;
        cluster_result.and(group_result)
    }

    pub fn print_log(&self) {
        self.group.print_log();
    }

    fn expect_phase(&self, allowed: &[ClusterPhase]) -> HerdResult<()> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" or ");
        Err(HerdError::InvalidClusterState {
            expected,
            actual: self.phase.to_string(),
        })
    }

    fn fail<T>(&mut self, error: HerdError) -> HerdResult<T> {
        warn!("Cluster start failed in phase {}: {}", self.phase, error);
        self.phase = ClusterPhase::Failed;
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::MasterLaunch;
    use crate::round_robin::RoundRobinLauncher;
    use async_trait::async_trait;
    use herd_config::HerdConfig;
    use herd_core::remaining_ports;
    use herd_runtime::{ProcessHandle, Runtime};
    use herd_session::MockSession;
    use std::sync::Arc;

    /// Master that is ready immediately without starting anything
    #[derive(Debug, Default)]
    struct InstantMaster {
        port: Option<u16>,
        fail: bool,
        cleanups: usize,
    }

    #[async_trait]
    impl MasterLauncher for InstantMaster {
        async fn start(
            &mut self,
            _group: &mut RuntimeGroup,
            ports: PortCandidates,
            _timeout: Duration,
        ) -> HerdResult<MasterLaunch> {
            if self.fail {
                return Err(HerdError::MasterStart {
                    host: "localhost".to_string(),
                    port: 0,
                    cause: "scripted".to_string(),
                });
            }
            let candidates = ports.ports();
            let port = candidates[0];
            self.port = Some(port);
            let remaining_ports = if ports.is_single() {
                Vec::new()
            } else {
                remaining_ports(&candidates, port)
            };
            Ok(MasterLaunch {
                port,
                remaining_ports,
            })
        }

        fn port(&self) -> Option<u16> {
            self.port
        }

        fn process(&self) -> Option<&ProcessHandle> {
            None
        }

        async fn cleanup(&mut self, _group: &mut RuntimeGroup) -> HerdResult<()> {
            self.port = None;
            self.cleanups += 1;
            Ok(())
        }
    }

    async fn cluster_with(master: InstantMaster, sessions: &[MockSession]) -> MasterWorkerCluster {
        let mut config = HerdConfig::default();
        config.logging.file_logging = false;
        let config = Arc::new(config);
        let mut runtimes = Vec::new();
        for session in sessions {
            runtimes.push(
                Runtime::connect(Arc::new(session.clone()), None, Arc::clone(&config))
                    .await
                    .unwrap(),
            );
        }
        let group = RuntimeGroup::with_config(runtimes, config).unwrap();
        let workers = RoundRobinLauncher::new("test", "worker {worker_port} {master_port}");
        MasterWorkerCluster::new(group, Box::new(master), Box::new(workers))
            .with_ports((62000..62010).collect())
    }

    #[tokio::test]
    async fn test_full_start_reaches_running() {
        let sessions = [MockSession::new("a"), MockSession::new("b")];
        let mut cluster = cluster_with(InstantMaster::default(), &sessions).await;
        assert_eq!(cluster.phase(), ClusterPhase::NotStarted);

        cluster.start(None, None).await.unwrap();
        assert_eq!(cluster.phase(), ClusterPhase::Running);
        assert_eq!(cluster.master_port(), Some(60000));
        // One worker per runtime by default
        assert_eq!(cluster.worker_ports_per_host().len(), 2);
        assert_eq!(cluster.remaining_ports().len(), 8);
    }

    #[tokio::test]
    async fn test_busy_default_port_falls_back_to_candidates() {
        let sessions = [MockSession::new("a").with_busy_port(60000)];
        let mut cluster = cluster_with(InstantMaster::default(), &sessions).await;

        cluster.start_master(None).await.unwrap();
        assert_eq!(cluster.master_port(), Some(62000));
        assert_eq!(cluster.remaining_ports().first(), Some(&62001));
    }

    #[tokio::test]
    async fn test_second_master_start_is_rejected() {
        let sessions = [MockSession::new("a")];
        let mut cluster = cluster_with(InstantMaster::default(), &sessions).await;

        cluster.start_master(Some(7000)).await.unwrap();
        let err = cluster.start_master(Some(7001)).await.unwrap_err();
        assert!(matches!(err, HerdError::InvalidClusterState { .. }));
        assert_eq!(cluster.master_port(), Some(7000));

        cluster.cleanup().await.unwrap();
        cluster.start_master(Some(7001)).await.unwrap();
        assert_eq!(cluster.phase(), ClusterPhase::MasterReady);
    }

    #[tokio::test]
    async fn test_master_failure_moves_to_failed() {
        let sessions = [MockSession::new("a")];
        let master = InstantMaster {
            fail: true,
            ..Default::default()
        };
        let mut cluster = cluster_with(master, &sessions).await;

        assert!(cluster.start(Some(3), None).await.is_err());
        assert_eq!(cluster.phase(), ClusterPhase::Failed);
        assert!(matches!(
            cluster.start_workers(None).await,
            Err(HerdError::InvalidClusterState { .. })
        ));
        assert!(cluster.start_master(None).await.is_err());

        cluster.cleanup().await.unwrap();
        assert_eq!(cluster.phase(), ClusterPhase::Stopped);
    }

    #[tokio::test]
    async fn test_worker_port_exhaustion_moves_to_failed() {
        let sessions = [MockSession::new("a")];
        let mut cluster = cluster_with(InstantMaster::default(), &sessions)
            .await
            .with_ports(vec![62000]);

        cluster.start_master(Some(7000)).await.unwrap();
        let err = cluster.start_workers(Some(2)).await.unwrap_err();
        assert!(matches!(err, HerdError::NoPortsLeft));
        assert_eq!(cluster.phase(), ClusterPhase::Failed);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent_from_any_phase() {
        let sessions = [MockSession::new("a")];
        let mut cluster = cluster_with(InstantMaster::default(), &sessions).await;
        cluster.cleanup().await.unwrap();
        cluster.cleanup().await.unwrap();
        assert_eq!(cluster.phase(), ClusterPhase::Stopped);

        cluster.start(Some(2), Some(7000)).await.unwrap();
        cluster.cleanup().await.unwrap();
        cluster.cleanup().await.unwrap();
        assert!(cluster.worker_ports_per_host().is_empty());
        assert_eq!(cluster.master_port(), None);

        cluster.shutdown().await.unwrap();
        assert!(sessions[0].is_closed());
    }
}
