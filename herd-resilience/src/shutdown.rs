//! Escalating shutdown of child processes

use log::{debug, error, info, warn};
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tokio::time::timeout;

const KILL_WAIT: Duration = Duration::from_secs(5);

/// Shutdown errors
#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("Failed to signal process: {0}")]
    SignalFailed(String),

    #[error("Process did not exit after kill")]
    Unresponsive,

    #[error("I/O error while waiting for process: {0}")]
    Io(#[from] std::io::Error),
}

/// Stops external processes: terminate, wait for a grace period, then kill
pub struct ProcessShutdownManager;

impl ProcessShutdownManager {
    /// Stop `child`, returning its exit status
    pub async fn shutdown_process(
        child: &mut Child,
        grace_period: Duration,
    ) -> Result<ExitStatus, ShutdownError> {
        if let Some(status) = child.try_wait()? {
            debug!("Process already exited with {:?}", status);
            return Ok(status);
        }

        if let Some(id) = child.id() {
            debug!("Sending terminate signal to process {}", id);
            Self::terminate(id);

            match timeout(grace_period, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Process {} terminated with {:?}", id, status);
                    return Ok(status);
                }
                Ok(Err(e)) => error!("Error waiting for process {}: {}", id, e),
                Err(_) => warn!("Process {} ignored terminate signal, killing it", id),
            }
        }

        child
            .start_kill()
            .map_err(|e| ShutdownError::SignalFailed(e.to_string()))?;
        match timeout(KILL_WAIT, child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => Err(ShutdownError::Unresponsive),
        }
    }

    #[cfg(all(unix, feature = "shutdown"))]
    fn terminate(id: u32) {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Err(e) = signal::kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to process {}: {}", id, e);
        }
    }

    #[cfg(not(all(unix, feature = "shutdown")))]
    fn terminate(id: u32) {
        debug!("No graceful terminate available for process {}", id);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_shutdown_running_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let status = ProcessShutdownManager::shutdown_process(&mut child, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_shutdown_exited_process() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        let status = ProcessShutdownManager::shutdown_process(&mut child, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(status.success());
    }
}
