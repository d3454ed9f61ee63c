//! phoenixd - self-updating service supervisor
//!
//! One binary, three roles: `supervise` keeps a `worker` and an `updater`
//! alive; when the updater installs a new build it launches a successor
//! tree and the old supervisor retires its worker and exits.

pub mod daemonize;
pub mod logging;
pub mod process;
pub mod supervisor;
pub mod updater;
pub mod worker;

pub use process::{ChildExit, ExitEvent, OsLauncher, ProcessHandle, ProcessLauncher, Role};
pub use supervisor::{Handover, RestartPolicy, Supervisor, SupervisorState};
pub use updater::{DetachedSuccessor, SuccessorLauncher, UpdateOutcome, Updater, UpdaterState};
