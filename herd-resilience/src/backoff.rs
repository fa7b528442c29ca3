//! Delays between repeated readiness probes

use rand::Rng;
use std::time::Duration;

/// Geometric backoff: `initial_delay * factor^(attempt-1)`, capped at `max_delay`.
///
/// A factor of 1.0 gives a fixed delay.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffCalculator {
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
    /// Relative spread applied to every delay, 0.0 for none
    jitter: f64,
}

impl BackoffCalculator {
    pub fn new(initial_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor: factor.max(1.0),
            jitter: 0.0,
        }
    }

    /// Doubling delays without jitter
    pub fn doubling(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::new(initial_delay, max_delay, 2.0)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0)
    }

    /// Spread every delay uniformly by `+-fraction` of its value
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Delay before the probe following `attempt` (1-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) as i32 - 1;
        let scale = self.factor.powi(exponent);
        let delay = if scale.is_finite() {
            Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * scale)
                .unwrap_or(self.max_delay)
                .min(self.max_delay)
        } else {
            self.max_delay
        };

        if self.jitter > 0.0 {
            let spread = rand::rng().random_range(-self.jitter..=self.jitter);
            delay.mul_f64(1.0 + spread)
        } else {
            delay
        }
    }
}
