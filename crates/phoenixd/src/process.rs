//! Child process management for the supervisor.
//!
//! Roles are separate OS processes started by re-executing the program image
//! with a role subcommand. Exit statuses are the only thing the supervisor
//! learns from them.

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{wait, waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use phoenix_common::ProgramImage;
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How often a bounded wait re-checks for exited children
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Process role under the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Worker,
    Updater,
}

impl Role {
    /// CLI subcommand that runs this role
    pub fn subcommand(&self) -> &'static str {
        match self {
            Role::Worker => "worker",
            Role::Updater => "updater",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subcommand())
    }
}

/// A live child owned by the supervisor
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub role: Role,
    pub pid: u32,
    pub alive: bool,
    pub started_at: Instant,
}

impl ProcessHandle {
    pub fn new(role: Role, pid: u32) -> Self {
        Self {
            role,
            pid,
            alive: true,
            started_at: Instant::now(),
        }
    }
}

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    Signaled(i32),
}

impl ChildExit {
    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Code(0))
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildExit::Code(code) => write!(f, "exit code {}", code),
            ChildExit::Signaled(sig) => write!(f, "signal {}", sig),
        }
    }
}

/// One reaped child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: u32,
    pub status: ChildExit,
}

/// Process operations the supervisor loop depends on
pub trait ProcessLauncher {
    /// Start a process for `role`, returning its pid
    fn spawn(&mut self, role: Role) -> Result<u32>;

    /// Block until any child exits.
    ///
    /// With a timeout, returns `Ok(None)` once it elapses without an exit.
    fn wait_any(&mut self, timeout: Option<Duration>) -> Result<Option<ExitEvent>>;

    /// Forcefully terminate `pid`. A process that already exited is not an error.
    fn kill(&mut self, pid: u32) -> Result<()>;
}

/// Launcher backed by real processes of the program image
pub struct OsLauncher {
    image: ProgramImage,
    config_path: Option<PathBuf>,
}

impl OsLauncher {
    pub fn new(image: ProgramImage, config_path: Option<PathBuf>) -> Self {
        Self { image, config_path }
    }

    fn command(&self, role: Role) -> Command {
        let mut cmd = Command::new(self.image.entry_point());
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg(role.subcommand())
            .current_dir(self.image.base_dir())
            .stdin(Stdio::null());
        cmd
    }
}

impl ProcessLauncher for OsLauncher {
    fn spawn(&mut self, role: Role) -> Result<u32> {
        let child = self
            .command(role)
            .spawn()
            .with_context(|| format!("Failed to spawn {} from {}", role, self.image.entry_point().display()))?;

        // Dropping the handle does not wait; the child is reaped by wait_any
        let pid = child.id();
        drop(child);
        Ok(pid)
    }

    fn wait_any(&mut self, timeout: Option<Duration>) -> Result<Option<ExitEvent>> {
        match timeout {
            None => loop {
                match wait() {
                    Ok(status) => {
                        if let Some(event) = exit_event(status) {
                            return Ok(Some(event));
                        }
                    }
                    Err(Errno::EINTR) => continue,
                    Err(e) => bail!("waitpid failed: {}", e),
                }
            },
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::StillAlive) => {}
                        Ok(status) => {
                            if let Some(event) = exit_event(status) {
                                return Ok(Some(event));
                            }
                            continue;
                        }
                        Err(Errno::EINTR) => continue,
                        Err(Errno::ECHILD) => {
                            // Nothing to reap; just sit out the hold-off
                            std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                            return Ok(None);
                        }
                        Err(e) => bail!("waitpid failed: {}", e),
                    }

                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
                }
            }
        }
    }

    fn kill(&mut self, pid: u32) -> Result<()> {
        let raw = i32::try_from(pid).context("pid out of range")?;
        match signal::kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => {
                info!("Sent SIGKILL to pid {}", pid);
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!("pid {} already exited", pid);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to send SIGKILL to {}", pid)),
        }
    }
}

fn exit_event(status: WaitStatus) -> Option<ExitEvent> {
    match status {
        WaitStatus::Exited(pid, code) => Some(ExitEvent {
            pid: pid.as_raw() as u32,
            status: ChildExit::Code(code),
        }),
        WaitStatus::Signaled(pid, sig, _) => Some(ExitEvent {
            pid: pid.as_raw() as u32,
            status: ChildExit::Signaled(sig as i32),
        }),
        _ => None,
    }
}

/// Spawn `cmd` in a new session so it outlives its parent.
///
/// # Safety
///
/// Uses `pre_exec` to call `setsid()`, which is async-signal-safe; the
/// closure performs no allocation or locking.
#[allow(unsafe_code)]
pub fn spawn_detached(cmd: &mut Command) -> Result<u32> {
    #[cfg(unix)]
    {
        use nix::libc;
        use std::os::unix::process::CommandExt;

        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let child = cmd.spawn().context("Failed to spawn detached process")?;
    let pid = child.id();
    drop(child);
    Ok(pid)
}
