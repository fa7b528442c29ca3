//! Dask scheduler and worker preset

use herd_config::HerdConfig;
use herd_runtime::RuntimeGroup;
use std::sync::Arc;

use crate::cluster::MasterWorkerCluster;
use crate::local::LocalMasterLauncher;
use crate::round_robin::RoundRobinLauncher;

/// Port of a dask scheduler when nothing else is configured
pub const DEFAULT_MASTER_PORT: u16 = 8786;

pub const SCHEDULER_COMMAND: &str = "dask-scheduler --port {port}";
pub const WORKER_COMMAND: &str =
    "dask-worker --worker-port={worker_port} --local-directory={working_dir} localhost:{master_port}";

/// Scheduler on the control node
pub fn master_launcher(config: &HerdConfig) -> LocalMasterLauncher {
    LocalMasterLauncher::new("dask-scheduler", SCHEDULER_COMMAND, config)
}

/// Workers placed round robin; worker ports are exposed to the whole group
pub fn worker_launcher() -> RoundRobinLauncher {
    RoundRobinLauncher::new("dask", WORKER_COMMAND).with_worker_tunnels(true)
}

/// Dask cluster on `group`
pub fn cluster(group: RuntimeGroup) -> MasterWorkerCluster {
    let config = Arc::clone(group.config());
    MasterWorkerCluster::new(
        group,
        Box::new(master_launcher(&config)),
        Box::new(worker_launcher()),
    )
    .with_default_master_port(DEFAULT_MASTER_PORT)
}
