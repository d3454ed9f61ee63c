//! Supervisor - root control loop of the process tree
//!
//! Keeps one Worker (and, when an update URL is configured, one Updater)
//! alive. Restarts are paced by a per-role backoff and circuit breaker.
//! A successful Updater exit means a successor tree is already running:
//! the Worker is killed and the loop ends.

pub mod backoff;
pub mod circuit;
pub mod registry;

pub use backoff::{BackoffConfig, BackoffState};
pub use circuit::{CircuitBreaker, CircuitState};
pub use registry::{RestartPolicy, RestartRegistry, RestartStatus};

use crate::process::{ExitEvent, OsLauncher, ProcessHandle, ProcessLauncher, Role};
use crate::updater;
use anyhow::Result;
use phoenix_common::{Config, ProgramImage};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Swapping,
    Exited,
}

/// What the supervisor observed when it handed over to a successor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handover {
    pub updater_pid: u32,
    /// Worker that was killed, if one was running
    pub worker_pid: Option<u32>,
}

pub struct Supervisor<L: ProcessLauncher> {
    launcher: L,
    updater_enabled: bool,
    handles: HashMap<Role, ProcessHandle>,
    registry: RestartRegistry,
    state: SupervisorState,
}

impl<L: ProcessLauncher> Supervisor<L> {
    pub fn new(launcher: L, policy: RestartPolicy, updater_enabled: bool) -> Self {
        let mut registry = RestartRegistry::new(policy);
        registry.register(Role::Worker);
        if updater_enabled {
            registry.register(Role::Updater);
        }

        Self {
            launcher,
            updater_enabled,
            handles: HashMap::new(),
            registry,
            state: SupervisorState::Starting,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn handle(&self, role: Role) -> Option<&ProcessHandle> {
        self.handles.get(&role)
    }

    pub fn registry(&self) -> &RestartRegistry {
        &self.registry
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Run until an Updater reports a successful update
    pub fn run(&mut self) -> Result<Handover> {
        self.state = SupervisorState::Running;
        info!(updater_enabled = self.updater_enabled, "Supervisor running");

        loop {
            if let Some(handover) = self.step()? {
                return Ok(handover);
            }
        }
    }

    /// One loop iteration: start missing roles, then wait for one exit or hold-off expiry
    pub fn step(&mut self) -> Result<Option<Handover>> {
        if self.state == SupervisorState::Starting {
            self.state = SupervisorState::Running;
        }

        self.spawn_missing();

        match self.launcher.wait_any(self.next_wake())? {
            Some(event) => Ok(self.handle_exit(event)),
            None => Ok(None),
        }
    }

    fn required_roles(&self) -> &'static [Role] {
        if self.updater_enabled {
            &[Role::Worker, Role::Updater]
        } else {
            &[Role::Worker]
        }
    }

    fn spawn_missing(&mut self) {
        let now = Instant::now();
        for &role in self.required_roles() {
            if self.handles.contains_key(&role) {
                continue;
            }
            if self.registry.ready_at(role).is_some_and(|at| at > now) {
                continue;
            }

            match self.launcher.spawn(role) {
                Ok(pid) => {
                    info!("Started {} (pid {})", role, pid);
                    self.handles.insert(role, ProcessHandle::new(role, pid));
                    self.registry.record_start(role);
                }
                Err(e) => {
                    let delay = self.registry.record_failure(role);
                    error!("Failed to start {}: {:#}; retrying in {:?}", role, e, delay);
                }
            }
        }
    }

    /// How long to wait before a held-off role becomes startable; `None` blocks
    fn next_wake(&self) -> Option<Duration> {
        let now = Instant::now();
        self.required_roles()
            .iter()
            .copied()
            .filter(|role| !self.handles.contains_key(role))
            .filter_map(|role| self.registry.ready_at(role))
            .map(|at| at.saturating_duration_since(now))
            .min()
    }

    fn handle_exit(&mut self, event: ExitEvent) -> Option<Handover> {
        let Some(role) = self
            .handles
            .values()
            .find(|h| h.pid == event.pid)
            .map(|h| h.role)
        else {
            debug!("Reaped untracked pid {} ({})", event.pid, event.status);
            return None;
        };

        let mut handle = self.handles.remove(&role)?;
        handle.alive = false;
        let lifetime = handle.started_at.elapsed();

        match role {
            Role::Worker => {
                let delay = self.registry.record_exit(role, lifetime);
                warn!(
                    "Worker (pid {}) exited with {} after {:?}; restarting in {:?}",
                    handle.pid, event.status, lifetime, delay
                );
                None
            }
            Role::Updater if event.status.success() => Some(self.swap(handle.pid)),
            Role::Updater => {
                let delay = self.registry.record_exit(role, lifetime);
                warn!(
                    "Updater (pid {}) failed: {}; restarting in {:?}",
                    handle.pid,
                    updater::describe_exit(event.status),
                    delay
                );
                None
            }
        }
    }

    /// Retire the Worker after the Updater launched a successor
    fn swap(&mut self, updater_pid: u32) -> Handover {
        self.state = SupervisorState::Swapping;
        info!("Updater (pid {}) applied an update; retiring worker", updater_pid);

        let worker_pid = self.handles.remove(&Role::Worker).map(|h| h.pid);
        if let Some(pid) = worker_pid {
            if let Err(e) = self.launcher.kill(pid) {
                warn!("Failed to kill worker {}: {:#}", pid, e);
            }
        }

        self.state = SupervisorState::Exited;
        Handover {
            updater_pid,
            worker_pid,
        }
    }
}

/// Entry point of the `supervise` role
pub fn run_supervisor(config: &Config, image: ProgramImage, config_path: Option<PathBuf>) -> Result<()> {
    let updater_enabled = config.update_source().is_some();
    if !updater_enabled {
        info!("No update URL configured; updater disabled");
    }

    info!("Supervising {}", image.entry_point().display());
    let launcher = OsLauncher::new(image, config_path);
    let mut supervisor = Supervisor::new(launcher, RestartPolicy::from(&config.supervisor), updater_enabled);

    let handover = supervisor.run()?;
    info!(
        updater_pid = handover.updater_pid,
        worker_pid = ?handover.worker_pid,
        "Handed over to successor; exiting"
    );
    Ok(())
}
