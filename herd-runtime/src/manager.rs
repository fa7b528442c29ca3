//! Host probing and group creation

use herd_config::HerdConfig;
use herd_core::{HerdError, HerdResult, LOCALHOST};
use herd_session::{HostFilter, LocalSession, RemoteSession, SshSession};
use std::sync::Arc;
use tracing::{debug, info};

use crate::group::RuntimeGroup;
use crate::runtime::Runtime;

/// Pool of validated runtimes from which groups are built
#[derive(Debug)]
pub struct RuntimeManager {
    runtimes: Vec<Runtime>,
    inactive_hosts: Vec<String>,
    config: Arc<HerdConfig>,
}

impl RuntimeManager {
    /// Try every candidate host; hosts that cannot be validated are kept as inactive.
    ///
    /// `localhost` and `127.0.0.1` count as one host.
    pub async fn probe<I, S, F>(hosts: I, config: Arc<HerdConfig>, session_factory: F) -> HerdResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&str) -> Arc<dyn RemoteSession>,
    {
        let mut runtimes: Vec<Runtime> = Vec::new();
        let mut inactive_hosts = Vec::new();

        for host in hosts {
            let host = host.into();
            let known = |name: &str| runtimes.iter().any(|r: &Runtime| r.host() == name);
            if known(&host) || (is_loopback(&host) && (known(LOCALHOST) || known("127.0.0.1"))) {
                continue;
            }

            debug!("Probing host {}", host);
            match Runtime::connect(session_factory(&host), None, Arc::clone(&config)).await {
                Ok(runtime) => {
                    info!("{} detected as valid runtime", host);
                    runtimes.push(runtime);
                }
                Err(HerdError::InvalidRuntime { cause, .. }) => {
                    debug!("Host {} is inactive: {}", host, cause);
                    inactive_hosts.push(host);
                }
                Err(e) => return Err(e),
            }
        }

        if runtimes.is_empty() {
            return Err(HerdError::NoRuntimesDetected(format!(
                "none of the probed hosts is reachable (inactive: {})",
                inactive_hosts.join(", ")
            )));
        }
        info!("Detected {} valid runtime(s)", runtimes.len());
        Ok(Self {
            runtimes,
            inactive_hosts,
            config,
        })
    }

    /// Probe hosts through ssh; `localhost` is run on the control node directly
    pub async fn probe_ssh<I, S>(hosts: I, config: Arc<HerdConfig>) -> HerdResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ssh = config.runtime.ssh.clone();
        Self::probe(hosts, Arc::clone(&config), move |host| {
            if host == LOCALHOST {
                Arc::new(LocalSession::new()) as Arc<dyn RemoteSession>
            } else {
                Arc::new(SshSession::new(host, ssh.clone())) as Arc<dyn RemoteSession>
            }
        })
        .await
    }

    /// Hosts of the runtimes still held by the manager
    pub fn hosts(&self) -> Vec<&str> {
        self.runtimes.iter().map(Runtime::host).collect()
    }

    /// Hosts that failed validation while probing
    pub fn inactive_hosts(&self) -> &[String] {
        &self.inactive_hosts
    }

    /// Move matching runtimes into a new group.
    ///
    /// `include` and `exclude` are mutually exclusive. Runtimes not taken
    /// stay with the manager for later groups.
    pub async fn create_group(
        &mut self,
        filter: Option<&HostFilter>,
        include: &[&str],
        exclude: &[&str],
    ) -> HerdResult<RuntimeGroup> {
        if !include.is_empty() && !exclude.is_empty() {
            return Err(HerdError::InvalidArgument(
                "either include or exclude hosts may be given, not both".to_string(),
            ));
        }
        if let Some(unknown) = include.iter().find(|h| !self.runtimes.iter().any(|r| r.host() == **h)) {
            return Err(HerdError::UnknownHost(unknown.to_string()));
        }

        let mut selected = Vec::new();
        for (index, runtime) in self.runtimes.iter().enumerate() {
            let host = runtime.host();
            let wanted = if include.is_empty() {
                !exclude.contains(&host)
            } else {
                include.contains(&host)
            };
            if !wanted {
                continue;
            }
            if let Some(filter) = filter {
                if !runtime.check_filter(filter).await? {
                    debug!("Runtime {} does not match the host filter", host);
                    continue;
                }
            }
            selected.push(index);
        }

        if selected.is_empty() {
            return Err(HerdError::NoRuntimesDetected(
                "no runtime matches the group criteria".to_string(),
            ));
        }

        let mut taken = Vec::with_capacity(selected.len());
        for index in selected.into_iter().rev() {
            taken.push(self.runtimes.remove(index));
        }
        taken.reverse();

        let group = RuntimeGroup::with_config(taken, Arc::clone(&self.config))?;
        info!("Created runtime group with {} runtime(s)", group.runtime_count());
        Ok(group)
    }

    /// Clean up every runtime still held by the manager
    pub async fn cleanup(&mut self) -> HerdResult<()> {
        let mut first_error = None;
        for runtime in &mut self.runtimes {
            if let Err(e) = runtime.cleanup().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn is_loopback(host: &str) -> bool {
    host == LOCALHOST || host == "127.0.0.1"
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_session::MockSession;

    fn test_config() -> Arc<HerdConfig> {
        let mut config = HerdConfig::default();
        config.logging.file_logging = false;
        Arc::new(config)
    }

    fn factory(host: &str) -> Arc<dyn RemoteSession> {
        let session = MockSession::new(host);
        match host {
            "down" => Arc::new(session.unreachable("connection refused")),
            "gpu" => Arc::new(session.with_response("nvidia-smi", "true\n")),
            _ => Arc::new(session),
        }
    }

    #[tokio::test]
    async fn test_probe_records_inactive_hosts() {
        let manager = RuntimeManager::probe(["a", "down", "b", "a"], test_config(), factory)
            .await
            .unwrap();
        assert_eq!(manager.hosts(), vec!["a", "b"]);
        assert_eq!(manager.inactive_hosts(), ["down".to_string()]);
    }

    #[tokio::test]
    async fn test_probe_without_valid_hosts() {
        let err = RuntimeManager::probe(["down"], test_config(), factory)
            .await
            .unwrap_err();
        assert!(matches!(err, HerdError::NoRuntimesDetected(_)));
    }

    #[tokio::test]
    async fn test_loopback_aliases_are_one_host() {
        let manager = RuntimeManager::probe(["localhost", "127.0.0.1"], test_config(), factory)
            .await
            .unwrap();
        assert_eq!(manager.hosts(), vec!["localhost"]);
    }

    #[tokio::test]
    async fn test_create_group_moves_runtimes() {
        let mut manager = RuntimeManager::probe(["a", "b", "c"], test_config(), factory)
            .await
            .unwrap();

        let group = manager.create_group(None, &[], &["b"]).await.unwrap();
        assert_eq!(group.hosts(), vec!["a", "c"]);
        assert_eq!(manager.hosts(), vec!["b"]);

        assert!(matches!(
            manager.create_group(None, &["a"], &[]).await,
            Err(HerdError::UnknownHost(_))
        ));
        assert!(manager.create_group(None, &["b"], &["b"]).await.is_err());
    }

    #[tokio::test]
    async fn test_create_group_with_filter() {
        let mut manager = RuntimeManager::probe(["cpu", "gpu"], test_config(), factory)
            .await
            .unwrap();
        let filter = HostFilter::new().with_command("nvidia-smi -L | grep -q GPU && echo true");

        let group = manager.create_group(Some(&filter), &[], &[]).await.unwrap();
        assert_eq!(group.hosts(), vec!["gpu"]);
        assert!(matches!(
            manager.create_group(Some(&filter), &[], &[]).await,
            Err(HerdError::NoRuntimesDetected(_))
        ));
    }
}
