//! Exponential backoff with jitter for role restarts

use rand::Rng;
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the second consecutive restart
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Backoff state for one role
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    failures: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failure and return the delay before the next start.
    ///
    /// The first failure after a reset restarts immediately.
    pub fn next_backoff(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        if self.failures == 1 {
            return Duration::ZERO;
        }

        let exponent = (self.failures - 2).min(i32::MAX as u32) as i32;
        let base = self.config.initial.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max.as_secs_f64());

        let jitter = if self.config.jitter > 0.0 && capped > 0.0 {
            rand::thread_rng().gen_range(0.0..=capped * self.config.jitter)
        } else {
            0.0
        };

        Duration::from_secs_f64((capped + jitter).min(self.config.max.as_secs_f64()))
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
