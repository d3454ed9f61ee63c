//! Restart bookkeeping per role

use super::{BackoffConfig, BackoffState, CircuitBreaker};
use crate::process::Role;
use phoenix_common::config::SupervisorConfig;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Restart status of a role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartStatus {
    /// Next start is immediate
    Healthy,
    /// Waiting out a backoff delay
    BackingOff,
    /// Held off until the circuit cooldown elapses
    CircuitOpen,
}

/// How aggressively crashed roles are restarted
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub backoff: BackoffConfig,
    /// A run at least this long resets the backoff
    pub healthy_after: Duration,
    pub max_rapid_restarts: u32,
    pub circuit_cooldown: Duration,
}

/// Longest backoff delay a config may ask for
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);
/// Longest circuit cooldown a config may ask for
pub const MAX_CIRCUIT_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        let max = Duration::from_millis(config.max_backoff_ms).min(MAX_BACKOFF);
        Self {
            backoff: BackoffConfig {
                initial: Duration::from_millis(config.initial_backoff_ms).min(max),
                max,
                multiplier: config.backoff_multiplier,
                jitter: config.backoff_jitter,
            },
            healthy_after: Duration::from_secs(config.healthy_after_secs),
            max_rapid_restarts: config.max_rapid_restarts,
            circuit_cooldown: Duration::from_secs(config.circuit_cooldown_secs).min(MAX_CIRCUIT_COOLDOWN),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

#[derive(Debug, Clone)]
struct RoleEntry {
    backoff: BackoffState,
    circuit: CircuitBreaker,
    status: RestartStatus,
    ready_at: Instant,
    starts: u32,
}

/// Registry of supervised roles
pub struct RestartRegistry {
    policy: RestartPolicy,
    roles: HashMap<Role, RoleEntry>,
}

impl RestartRegistry {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            roles: HashMap::new(),
        }
    }

    /// Register a role; it may start immediately
    pub fn register(&mut self, role: Role) {
        self.roles.insert(
            role,
            RoleEntry {
                backoff: BackoffState::new(self.policy.backoff.clone()),
                circuit: CircuitBreaker::new(self.policy.max_rapid_restarts, self.policy.circuit_cooldown),
                status: RestartStatus::Healthy,
                ready_at: Instant::now(),
                starts: 0,
            },
        );
    }

    /// Record a successful start
    pub fn record_start(&mut self, role: Role) {
        if let Some(entry) = self.roles.get_mut(&role) {
            entry.starts += 1;
        }
    }

    /// Record a child exit after `lifetime` and return the delay before the restart
    ///
    /// A healthy run restarts immediately and does not count towards the
    /// crash-loop threshold; it also closes a circuit whose trial run it was.
    pub fn record_exit(&mut self, role: Role, lifetime: Duration) -> Duration {
        if lifetime < self.policy.healthy_after {
            return self.record_failure(role);
        }

        self.record_success(role);
        if let Some(entry) = self.roles.get_mut(&role) {
            entry.ready_at = Instant::now();
        }
        Duration::ZERO
    }

    /// Record a failed run or failed spawn and return the delay before the next attempt
    pub fn record_failure(&mut self, role: Role) -> Duration {
        let Some(entry) = self.roles.get_mut(&role) else {
            return Duration::ZERO;
        };

        entry.circuit.record_failure();

        let delay = if entry.circuit.is_open() {
            entry.status = RestartStatus::CircuitOpen;
            entry.circuit.remaining_cooldown()
        } else {
            let delay = entry.backoff.next_backoff();
            entry.status = if delay.is_zero() {
                RestartStatus::Healthy
            } else {
                RestartStatus::BackingOff
            };
            delay
        };

        let now = Instant::now();
        entry.ready_at = now.checked_add(delay).unwrap_or(now);
        delay
    }

    /// Record a healthy run
    pub fn record_success(&mut self, role: Role) {
        if let Some(entry) = self.roles.get_mut(&role) {
            entry.backoff.reset();
            entry.circuit.record_success();
            entry.status = RestartStatus::Healthy;
        }
    }

    /// Earliest instant the role may be started
    pub fn ready_at(&self, role: Role) -> Option<Instant> {
        self.roles.get(&role).map(|e| e.ready_at)
    }

    pub fn status(&self, role: Role) -> Option<RestartStatus> {
        self.roles.get(&role).map(|e| e.status)
    }

    /// Number of successful starts so far
    pub fn starts(&self, role: Role) -> u32 {
        self.roles.get(&role).map(|e| e.starts).unwrap_or(0)
    }
}

impl Default for RestartRegistry {
    fn default() -> Self {
        Self::new(RestartPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            backoff: BackoffConfig {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: 0.0,
            },
            healthy_after: Duration::from_secs(10),
            max_rapid_restarts: 5,
            circuit_cooldown: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_restart_registry() {
        let mut registry = RestartRegistry::new(policy());
        registry.register(Role::Worker);

        assert_eq!(registry.status(Role::Worker), Some(RestartStatus::Healthy));

        // First crash restarts immediately
        let delay = registry.record_exit(Role::Worker, Duration::from_millis(5));
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(registry.status(Role::Worker), Some(RestartStatus::Healthy));

        let delay = registry.record_exit(Role::Worker, Duration::from_millis(5));
        assert_eq!(delay, Duration::from_millis(100));
        assert_eq!(registry.status(Role::Worker), Some(RestartStatus::BackingOff));
        assert!(registry.ready_at(Role::Worker).unwrap() > Instant::now());

        registry.record_success(Role::Worker);
        assert_eq!(registry.status(Role::Worker), Some(RestartStatus::Healthy));
    }

    #[test]
    fn test_long_run_resets_backoff() {
        let mut registry = RestartRegistry::new(policy());
        registry.register(Role::Updater);

        registry.record_exit(Role::Updater, Duration::ZERO);
        registry.record_exit(Role::Updater, Duration::ZERO);
        registry.record_exit(Role::Updater, Duration::ZERO);

        let delay = registry.record_exit(Role::Updater, Duration::from_secs(30));
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn test_circuit_breaker_integration() {
        let mut registry = RestartRegistry::new(policy());
        registry.register(Role::Worker);

        let mut last = Duration::ZERO;
        for _ in 0..5 {
            last = registry.record_failure(Role::Worker);
        }

        assert_eq!(registry.status(Role::Worker), Some(RestartStatus::CircuitOpen));
        assert!(last > Duration::from_secs(50));

        // Still held off, never abandoned
        let again = registry.record_failure(Role::Worker);
        assert!(again > Duration::from_secs(50));
        assert_eq!(registry.status(Role::Worker), Some(RestartStatus::CircuitOpen));
    }

    #[test]
    fn test_healthy_trial_run_closes_circuit() {
        let mut registry = RestartRegistry::new(RestartPolicy {
            max_rapid_restarts: 2,
            circuit_cooldown: Duration::from_millis(20),
            ..policy()
        });
        registry.register(Role::Worker);

        registry.record_exit(Role::Worker, Duration::from_millis(1));
        registry.record_exit(Role::Worker, Duration::from_millis(1));
        assert_eq!(registry.status(Role::Worker), Some(RestartStatus::CircuitOpen));

        std::thread::sleep(Duration::from_millis(40));

        // The trial run was healthy
        let delay = registry.record_exit(Role::Worker, Duration::from_secs(30));
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(registry.status(Role::Worker), Some(RestartStatus::Healthy));

        // A single crash afterwards is an ordinary first failure
        let delay = registry.record_exit(Role::Worker, Duration::from_millis(1));
        assert_eq!(delay, Duration::ZERO);
        assert_ne!(registry.status(Role::Worker), Some(RestartStatus::CircuitOpen));
    }

    #[test]
    fn test_failed_trial_run_reopens_circuit() {
        let mut registry = RestartRegistry::new(RestartPolicy {
            max_rapid_restarts: 2,
            circuit_cooldown: Duration::from_millis(20),
            ..policy()
        });
        registry.register(Role::Worker);

        registry.record_exit(Role::Worker, Duration::from_millis(1));
        registry.record_exit(Role::Worker, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(40));

        let delay = registry.record_exit(Role::Worker, Duration::from_millis(1));
        assert!(delay > Duration::ZERO);
        assert_eq!(registry.status(Role::Worker), Some(RestartStatus::CircuitOpen));
    }

    #[test]
    fn test_oversized_config_is_clamped() {
        let config = SupervisorConfig {
            initial_backoff_ms: u64::MAX,
            max_backoff_ms: u64::MAX,
            circuit_cooldown_secs: u64::MAX,
            max_rapid_restarts: 2,
            backoff_jitter: 0.0,
            ..SupervisorConfig::default()
        };
        let policy = RestartPolicy::from(&config);
        assert_eq!(policy.backoff.max, MAX_BACKOFF);
        assert_eq!(policy.backoff.initial, MAX_BACKOFF);
        assert_eq!(policy.circuit_cooldown, MAX_CIRCUIT_COOLDOWN);

        let mut registry = RestartRegistry::new(policy);
        registry.register(Role::Worker);
        registry.record_failure(Role::Worker);
        let delay = registry.record_failure(Role::Worker);

        assert!(delay <= MAX_CIRCUIT_COOLDOWN);
        assert!(registry.ready_at(Role::Worker).unwrap() > Instant::now());
    }

    #[test]
    fn test_roles_are_independent() {
        let mut registry = RestartRegistry::new(policy());
        registry.register(Role::Worker);
        registry.register(Role::Updater);

        registry.record_failure(Role::Worker);
        registry.record_failure(Role::Worker);
        registry.record_start(Role::Updater);

        assert_eq!(registry.status(Role::Worker), Some(RestartStatus::BackingOff));
        assert_eq!(registry.status(Role::Updater), Some(RestartStatus::Healthy));
        assert_eq!(registry.starts(Role::Updater), 1);
        assert_eq!(registry.starts(Role::Worker), 0);
    }

    #[test]
    fn test_unregistered_role_is_ignored() {
        let mut registry = RestartRegistry::default();
        assert_eq!(registry.record_failure(Role::Updater), Duration::ZERO);
        assert_eq!(registry.status(Role::Updater), None);
        assert!(registry.ready_at(Role::Updater).is_none());
    }
}
