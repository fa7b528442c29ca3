//! Bounded readiness polling
//!
//! A readiness poll repeatedly runs a probe against a process that was just
//! started until the probe reports it ready. The whole poll, including a
//! probe that is still running, is bounded by a wall-clock timeout.

use crate::backoff::BackoffCalculator;
use log::{debug, warn};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep_until, timeout_at, Instant};

/// Outcome of a single readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    /// The process is reachable
    Ready,
    /// Not reachable yet; try again
    NotReady(String),
    /// The process can never become ready (e.g. it already exited)
    Failed(String),
}

/// Readiness poll errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("not ready after {attempts} probes within {timeout:?}: {last_status}")]
    TimedOut {
        timeout: Duration,
        attempts: u32,
        last_status: String,
    },

    #[error("readiness probe failed: {0}")]
    ProbeFailed(String),
}

/// Timeout-governed probe loop
#[derive(Debug, Clone)]
pub struct ReadinessPoll {
    timeout: Duration,
    backoff: BackoffCalculator,
}

impl ReadinessPoll {
    pub fn new(timeout: Duration, backoff: BackoffCalculator) -> Self {
        Self { timeout, backoff }
    }

    /// Poll with doubling delays between `initial_delay` and `max_delay`
    pub fn with_delays(timeout: Duration, initial_delay: Duration, max_delay: Duration) -> Self {
        Self::new(timeout, BackoffCalculator::doubling(initial_delay, max_delay))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `probe` until it reports [`ProbeStatus::Ready`].
    ///
    /// Returns the number of probes that were needed.
    pub async fn wait_until_ready<F, Fut>(&self, mut probe: F) -> Result<u32, PollError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ProbeStatus>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0u32;
        let mut last_status = String::from("no probe completed");

        loop {
            attempts += 1;
            match timeout_at(deadline, probe(attempts)).await {
                Ok(ProbeStatus::Ready) => {
                    debug!("Ready after {} probe(s)", attempts);
                    return Ok(attempts);
                }
                Ok(ProbeStatus::NotReady(status)) => {
                    debug!("Probe {} not ready: {}", attempts, status);
                    last_status = status;
                }
                Ok(ProbeStatus::Failed(reason)) => {
                    warn!("Readiness probe failed permanently: {}", reason);
                    return Err(PollError::ProbeFailed(reason));
                }
                Err(_) => {
                    last_status = "probe did not complete before the deadline".to_string();
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PollError::TimedOut {
                    timeout: self.timeout,
                    attempts,
                    last_status,
                });
            }

            let next = now + self.backoff.calculate_delay(attempts);
            sleep_until(next.min(deadline)).await;
        }
    }
}
