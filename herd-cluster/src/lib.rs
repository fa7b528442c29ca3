//! Master/worker cluster bootstrap for herd
//!
//! A [`MasterWorkerCluster`] drives two strategies over a runtime group:
//! a [`MasterLauncher`] that starts the coordinator and waits until it is
//! reachable, and a [`WorkerLauncher`] that places the workers.
//! [`dask`] and [`hyperopt`] provide ready-made strategies for those
//! frameworks.

pub mod cluster;
pub mod dask;
pub mod hyperopt;
pub mod launcher;
pub mod local;
pub mod round_robin;

// Re-export main types
pub use cluster::{ClusterPhase, MasterWorkerCluster};
pub use hyperopt::{HyperoptCluster, HyperoptOptions};
pub use launcher::{MasterLaunch, MasterLauncher, WorkerLauncher};
pub use local::LocalMasterLauncher;
pub use round_robin::RoundRobinLauncher;
