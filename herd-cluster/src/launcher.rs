//! Placement strategies for the master and the workers of a cluster

use async_trait::async_trait;
use herd_core::{HerdResult, PortCandidates};
use herd_runtime::{ProcessHandle, RuntimeGroup};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;
use tracing::info;

/// Result of a successful master start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterLaunch {
    /// Port the master listens on
    pub port: u16,
    /// Unused candidates when a list was given; empty for a single port
    pub remaining_ports: Vec<u16>,
}

/// Strategy that starts the coordinator of a cluster
#[async_trait]
pub trait MasterLauncher: Send + Sync + Debug {
    /// Start the master on one of `ports` and wait until it is reachable.
    ///
    /// A single busy port fails with `PortInUse`, an exhausted list with
    /// `NoPortsLeft`, and a master that is not reachable within `timeout`
    /// with `MasterStart`.
    async fn start(
        &mut self,
        group: &mut RuntimeGroup,
        ports: PortCandidates,
        timeout: Duration,
    ) -> HerdResult<MasterLaunch>;

    /// Port of the started master
    fn port(&self) -> Option<u16>;

    /// Process of the started master, unless it detached itself
    fn process(&self) -> Option<&ProcessHandle>;

    /// Stop the master and release what it holds
    async fn cleanup(&mut self, group: &mut RuntimeGroup) -> HerdResult<()>;
}

/// Strategy that places the workers of a cluster in the group
#[async_trait]
pub trait WorkerLauncher: Send + Sync + Debug {
    /// Start `worker_count` workers connected to the master on `master_port`.
    ///
    /// Workers that listen on a port consume one of `ports` each; the unused
    /// remainder is returned.
    async fn start(
        &mut self,
        group: &mut RuntimeGroup,
        worker_count: usize,
        master_port: u16,
        ports: Vec<u16>,
    ) -> HerdResult<Vec<u16>>;

    /// Worker ports by host
    fn ports_per_host(&self) -> &BTreeMap<String, Vec<u16>>;

    /// Make every worker reachable from every other runtime on the same port.
    ///
    /// Needed when workers talk to each other directly rather than only
    /// through the master.
    async fn setup_worker_ssh_tunnels(&self, group: &mut RuntimeGroup) -> HerdResult<()> {
        info!("Setting up tunnels for inter-worker communication");
        for (host, ports) in self.ports_per_host() {
            for &port in ports {
                group.expose_port_from_runtime_to_group(host, port, None).await?;
            }
        }
        Ok(())
    }

    /// Stop the workers
    async fn cleanup(&mut self, group: &mut RuntimeGroup) -> HerdResult<()>;
}
