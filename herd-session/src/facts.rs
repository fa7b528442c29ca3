//! Read-only host facts and host filters

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{SessionError, SessionResult};
use crate::session::{shell_quote, RemoteSession};

/// Hardware and software facts of one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFacts {
    pub os: String,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub python_version: Option<String>,
    pub gpu_count: u32,
}

impl HostFacts {
    /// Query all facts through `session`
    pub async fn collect(session: &dyn RemoteSession) -> SessionResult<Self> {
        let os = query(session, "uname -s").await?;
        let cpu_cores = parse_number(
            "nproc",
            &query(session, "nproc 2>/dev/null || getconf _NPROCESSORS_ONLN").await?,
        )?;
        let memory_kib: u64 = parse_number(
            "MemTotal",
            &query(session, "awk '/MemTotal/ {print $2}' /proc/meminfo").await?,
        )?;
        let python = query(session, "python3 --version 2>&1 || true").await?;
        let gpu_count = parse_number(
            "nvidia-smi",
            &query(session, "nvidia-smi -L 2>/dev/null | grep -c GPU || true").await?,
        )
        .unwrap_or(0);

        Ok(Self {
            os,
            cpu_cores,
            memory_bytes: memory_kib * 1024,
            python_version: python
                .strip_prefix("Python ")
                .map(|version| version.trim().to_string()),
            gpu_count,
        })
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_count > 0
    }
}

/// Requirements a host has to meet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFilter {
    pub gpu_required: bool,
    pub min_memory_bytes: Option<u64>,
    pub min_cpu_cores: Option<u32>,
    /// Executables that must resolve on the host
    pub installed_executables: Vec<String>,
    /// Shell commands that must print `true`
    pub filter_commands: Vec<String>,
}

impl HostFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gpu(mut self) -> Self {
        self.gpu_required = true;
        self
    }

    pub fn with_min_memory(mut self, bytes: u64) -> Self {
        self.min_memory_bytes = Some(bytes);
        self
    }

    pub fn with_min_cpu_cores(mut self, cores: u32) -> Self {
        self.min_cpu_cores = Some(cores);
        self
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.installed_executables.push(executable.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.filter_commands.push(command.into());
        self
    }

    /// Whether only commands and executables are checked
    fn needs_facts(&self) -> bool {
        self.gpu_required || self.min_memory_bytes.is_some() || self.min_cpu_cores.is_some()
    }

    /// Check every requirement against the host behind `session`
    pub async fn matches(&self, session: &dyn RemoteSession) -> SessionResult<bool> {
        if self.needs_facts() {
            let facts = HostFacts::collect(session).await?;
            if !self.matches_facts(&facts) {
                debug!("Host {} does not meet hardware requirements", session.host());
                return Ok(false);
            }
        }

        for executable in &self.installed_executables {
            let check = format!(
                "hash {} 2>/dev/null && echo \"true\" || echo \"\"",
                shell_quote(executable)
            );
            if query(session, &check).await? != "true" {
                debug!("Executable {} missing on {}", executable, session.host());
                return Ok(false);
            }
        }

        for command in &self.filter_commands {
            if query(session, command).await? != "true" {
                debug!("Filter command `{}` rejected {}", command, session.host());
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Check the hardware requirements against known facts
    pub fn matches_facts(&self, facts: &HostFacts) -> bool {
        if self.gpu_required && !facts.has_gpu() {
            return false;
        }
        if let Some(min) = self.min_memory_bytes {
            if facts.memory_bytes < min {
                return false;
            }
        }
        if let Some(min) = self.min_cpu_cores {
            if facts.cpu_cores < min {
                return false;
            }
        }
        true
    }
}

async fn query(session: &dyn RemoteSession, command: &str) -> SessionResult<String> {
    let output = session.run(command, None, &BTreeMap::new()).await?;
    Ok(output.stdout.trim().to_string())
}

fn parse_number<T: std::str::FromStr>(command: &str, value: &str) -> SessionResult<T> {
    value.trim().parse().map_err(|_| SessionError::UnexpectedOutput {
        command: command.to_string(),
        output: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSession;

    fn mock_host() -> MockSession {
        MockSession::new("gpu-box")
            .with_response("uname -s", "Linux\n")
            .with_response("nproc", "16\n")
            .with_response("MemTotal", "32000000\n")
            .with_response("python3 --version", "Python 3.11.4\n")
            .with_response("nvidia-smi", "2\n")
            .with_response("hash docker", "true\n")
            .with_response("hash kubectl", "\n")
    }

    #[tokio::test]
    async fn test_collect_facts() {
        let facts = HostFacts::collect(&mock_host()).await.unwrap();
        assert_eq!(facts.os, "Linux");
        assert_eq!(facts.cpu_cores, 16);
        assert_eq!(facts.memory_bytes, 32_000_000 * 1024);
        assert_eq!(facts.python_version.as_deref(), Some("3.11.4"));
        assert_eq!(facts.gpu_count, 2);
    }

    #[tokio::test]
    async fn test_filter() {
        let host = mock_host();
        let filter = HostFilter::new()
            .with_gpu()
            .with_min_cpu_cores(8)
            .with_executable("docker");
        assert!(filter.matches(&host).await.unwrap());

        let too_big = HostFilter::new().with_min_cpu_cores(64);
        assert!(!too_big.matches(&host).await.unwrap());

        let missing = HostFilter::new().with_executable("kubectl");
        assert!(!missing.matches(&host).await.unwrap());
    }

    #[tokio::test]
    async fn test_filter_commands() {
        let host = MockSession::new("h").with_response("test -d /data", "true\n");
        let filter = HostFilter::new().with_command("test -d /data && echo true");
        assert!(filter.matches(&host).await.unwrap());
        let rejecting = HostFilter::new().with_command("echo nope");
        assert!(!rejecting.matches(&host).await.unwrap());
    }
}
