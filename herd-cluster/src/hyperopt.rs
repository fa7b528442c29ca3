//! Hyperopt preset: a local MongoDB as master and `hyperopt-mongo-worker`s
//!
//! The workers need no port of their own. After the master is up the group
//! environment carries `MONGO_CONNECTION_URL`, so objective functions run on
//! the runtimes can find the trials database.

use herd_core::{HerdError, HerdResult};
use herd_runtime::RuntimeGroup;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cluster::{ClusterPhase, MasterWorkerCluster};
use crate::local::LocalMasterLauncher;
use crate::round_robin::RoundRobinLauncher;

pub const DEFAULT_MASTER_PORT: u16 = 27017;
pub const MONGO_LOG_FILENAME: &str = "hyperopt_mongo.log";
pub const ENV_NAME_MONGO_URL: &str = "MONGO_CONNECTION_URL";
pub const DEFAULT_DBNAME: &str = "hyperopt";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Settings of a hyperopt cluster
#[derive(Debug, Clone)]
pub struct HyperoptOptions {
    /// Database directory; `<log_directory>/mongodb` if unset
    pub dbpath: Option<PathBuf>,
    pub dbname: String,
    /// How often workers ask MongoDB for new trials
    pub poll_interval: Duration,
}

impl Default for HyperoptOptions {
    fn default() -> Self {
        Self {
            dbpath: None,
            dbname: DEFAULT_DBNAME.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// `mongod` forking into the background on the control node
pub fn mongo_launcher(dbpath: &Path, config: &herd_config::HerdConfig) -> LocalMasterLauncher {
    let db = dbpath.display();
    LocalMasterLauncher::new(
        "mongod",
        format!("mongod --fork --logpath={db}/{MONGO_LOG_FILENAME} --dbpath={db} --port={{port}}"),
        config,
    )
    .with_stop_command(format!("mongod --shutdown --dbpath={db}"))
    .detached()
}

/// Portless workers placed round robin
pub fn worker_launcher(dbname: &str, poll_interval: Duration) -> RoundRobinLauncher {
    RoundRobinLauncher::new(
        "hyperopt",
        format!(
            "hyperopt-mongo-worker --mongo=localhost:{{master_port}}/{dbname} --poll-interval={}",
            poll_interval.as_secs_f64()
        ),
    )
    .without_worker_ports()
}

/// Master/worker cluster running hyperopt trials against MongoDB
#[derive(Debug)]
pub struct HyperoptCluster {
    cluster: MasterWorkerCluster,
    dbpath: PathBuf,
    dbname: String,
}

impl HyperoptCluster {
    /// Build the cluster and create the database directory if needed
    pub fn new(group: RuntimeGroup, options: HyperoptOptions) -> HerdResult<Self> {
        if options.dbname.is_empty() {
            return Err(HerdError::InvalidArgument("dbname must not be empty".to_string()));
        }
        if options.poll_interval.is_zero() {
            return Err(HerdError::InvalidArgument(
                "poll_interval must be positive".to_string(),
            ));
        }

        let config = Arc::clone(group.config());
        let dbpath = options
            .dbpath
            .unwrap_or_else(|| config.logging.log_directory.join("mongodb"));
        std::fs::create_dir_all(&dbpath)?;
        debug!("MongoDB directory: {}", dbpath.display());

        let cluster = MasterWorkerCluster::new(
            group,
            Box::new(mongo_launcher(&dbpath, &config)),
            Box::new(worker_launcher(&options.dbname, options.poll_interval)),
        )
        .with_default_master_port(DEFAULT_MASTER_PORT);

        Ok(Self {
            cluster,
            dbpath,
            dbname: options.dbname,
        })
    }

    pub fn dbpath(&self) -> &Path {
        &self.dbpath
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    pub fn phase(&self) -> ClusterPhase {
        self.cluster.phase()
    }

    pub fn master_port(&self) -> Option<u16> {
        self.cluster.master_port()
    }

    pub fn cluster(&self) -> &MasterWorkerCluster {
        &self.cluster
    }

    pub fn cluster_mut(&mut self) -> &mut MasterWorkerCluster {
        &mut self.cluster
    }

    /// `mongo://localhost:<port>/<dbname>`
    pub fn mongo_url(&self) -> HerdResult<String> {
        let port = self.cluster.master_port().ok_or_else(|| {
            warn!("MongoDB url requested before the master port is known");
            HerdError::InvalidClusterState {
                expected: ClusterPhase::MasterReady.to_string(),
                actual: self.cluster.phase().to_string(),
            }
        })?;
        Ok(format!("mongo://localhost:{}/{}", port, self.dbname))
    }

    /// Url in the form expected by hyperopt's `MongoTrials`
    pub fn mongo_trial_url(&self) -> HerdResult<String> {
        Ok(format!("{}/jobs", self.mongo_url()?))
    }

    pub async fn start(&mut self, worker_count: Option<usize>, master_port: Option<u16>) -> HerdResult<()> {
        self.start_master(master_port).await?;
        self.start_workers(worker_count).await
    }

    /// Start MongoDB and publish its trials url to every runtime
    pub async fn start_master(&mut self, master_port: Option<u16>) -> HerdResult<()> {
        self.cluster.start_master(master_port).await?;
        let url = self.mongo_trial_url()?;
        self.cluster
            .runtime_group_mut()
            .add_env_variables(BTreeMap::from([(ENV_NAME_MONGO_URL.to_string(), url)]));
        Ok(())
    }

    pub async fn start_workers(&mut self, count: Option<usize>) -> HerdResult<()> {
        self.cluster.start_workers(count).await
    }

    pub async fn cleanup(&mut self) -> HerdResult<()> {
        self.cluster.cleanup().await
    }

    pub async fn shutdown(self) -> HerdResult<()> {
        self.cluster.shutdown().await
    }

    pub fn print_log(&self) {
        self.cluster.print_log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_config::HerdConfig;
    use herd_runtime::Runtime;
    use herd_session::MockSession;

    async fn group_logging_to(dir: &Path) -> RuntimeGroup {
        let mut config = HerdConfig::default();
        config.logging.file_logging = false;
        config.logging.log_directory = dir.to_path_buf();
        let runtime = Runtime::connect(Arc::new(MockSession::new("a")), None, Arc::new(config))
            .await
            .unwrap();
        RuntimeGroup::new(vec![runtime]).unwrap()
    }

    #[test]
    fn test_commands() {
        let config = HerdConfig::default();
        let master = mongo_launcher(Path::new("/data/db"), &config);
        assert_eq!(
            master.start_command(27017),
            "mongod --fork --logpath=/data/db/hyperopt_mongo.log --dbpath=/data/db --port=27017"
        );
        assert_eq!(
            master.stop_command(27017).as_deref(),
            Some("mongod --shutdown --dbpath=/data/db")
        );

        let workers = worker_launcher("trials", Duration::from_millis(100));
        assert_eq!(
            workers.launch_command(0, 27017, 0, "/wd"),
            "hyperopt-mongo-worker --mongo=localhost:27017/trials --poll-interval=0.1"
        );
    }

    #[tokio::test]
    async fn test_default_dbpath_is_created() {
        let logs = tempfile::tempdir().unwrap();
        let cluster = HyperoptCluster::new(group_logging_to(logs.path()).await, HyperoptOptions::default())
            .unwrap();
        assert_eq!(cluster.dbpath(), logs.path().join("mongodb"));
        assert!(cluster.dbpath().is_dir());
        assert_eq!(cluster.dbname(), DEFAULT_DBNAME);
        assert_eq!(cluster.phase(), ClusterPhase::NotStarted);
    }

    #[tokio::test]
    async fn test_invalid_options_are_rejected() {
        let logs = tempfile::tempdir().unwrap();
        let options = HyperoptOptions {
            dbname: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            HyperoptCluster::new(group_logging_to(logs.path()).await, options),
            Err(HerdError::InvalidArgument(_))
        ));

        let options = HyperoptOptions {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(HyperoptCluster::new(group_logging_to(logs.path()).await, options).is_err());
    }

    #[tokio::test]
    async fn test_urls_need_a_master() {
        let logs = tempfile::tempdir().unwrap();
        let cluster = HyperoptCluster::new(group_logging_to(logs.path()).await, HyperoptOptions::default())
            .unwrap();
        assert!(matches!(
            cluster.mongo_trial_url(),
            Err(HerdError::InvalidClusterState { .. })
        ));
    }
}
