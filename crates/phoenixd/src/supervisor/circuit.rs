//! Crash-loop breaker for supervised roles
//!
//! Driven by child exits rather than by calls it could reject: every exit
//! is recorded as a rapid failure or a healthy run, and the breaker's state
//! is derived from the clock at the moment it is asked or told something.

use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Restarts flow normally
    Closed,
    /// Role is held off until the cooldown elapses
    Open,
    /// Cooldown elapsed; the next run is a trial
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    /// Rapid failures since the last healthy run
    rapid_failures: u32,
    /// Rapid failures that open the circuit
    threshold: u32,
    cooldown: Duration,
    /// Set while the circuit is open or half-open
    tripped_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            rapid_failures: 0,
            threshold: threshold.max(1),
            cooldown,
            tripped_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.tripped_at {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() < self.cooldown => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// A run ended before it counted as healthy, or a start failed
    pub fn record_failure(&mut self) {
        match self.state() {
            CircuitState::Closed => {
                self.rapid_failures += 1;
                if self.rapid_failures >= self.threshold {
                    self.trip();
                }
            }
            // The trial run failed
            CircuitState::HalfOpen => self.trip(),
            CircuitState::Open => {}
        }
    }

    /// A run lasted long enough to count as healthy
    pub fn record_success(&mut self) {
        self.rapid_failures = 0;
        self.tripped_at = None;
    }

    /// Time left before a trial run is allowed; zero unless open
    pub fn remaining_cooldown(&self) -> Duration {
        match self.tripped_at {
            Some(at) => self.cooldown.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    pub fn rapid_failures(&self) -> u32 {
        self.rapid_failures
    }

    fn trip(&mut self) {
        self.tripped_at = Some(Instant::now());
        self.rapid_failures = 0;
    }
}
