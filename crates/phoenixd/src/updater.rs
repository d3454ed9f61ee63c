//! Updater role - poll, download, install, launch successor
//!
//! Runs as its own process so the blocking download never stalls the
//! supervisor. Its only effect on the supervisor is the exit status:
//!
//! | code | meaning                                              |
//! |------|------------------------------------------------------|
//! | 0    | update installed and successor launched              |
//! | 1    | generic failure (config, I/O, successor launch)      |
//! | 2    | archive rejected, previous image intact              |
//! | 3    | archive rejected after the previous image was removed |

use crate::process::{spawn_detached, ChildExit};
use anyhow::Result;
use phoenix_common::archive::{clear_scratch, extract_in_place, extract_to_scratch, remove_entry_point};
use phoenix_common::{
    clear_staging, ArtifactSource, Config, FetchError, HttpFetcher, InstallStrategy, ProgramImage,
    StagingArtifact, UpdateRecord, UpdateSource,
};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const EXIT_APPLIED: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_ARCHIVE_REJECTED: i32 = 2;
pub const EXIT_IMAGE_LOST: i32 = 3;

/// Updater lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterState {
    Idle,
    Polling,
    Downloading,
    Extracting,
    Replacing,
    Launching,
    Done,
}

/// Terminal result of one Updater process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied { successor_pid: u32 },
    ArchiveRejected { reason: String, image_intact: bool },
    Failed { reason: String },
}

impl UpdateOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            UpdateOutcome::Applied { .. } => EXIT_APPLIED,
            UpdateOutcome::ArchiveRejected { image_intact: true, .. } => EXIT_ARCHIVE_REJECTED,
            UpdateOutcome::ArchiveRejected { image_intact: false, .. } => EXIT_IMAGE_LOST,
            UpdateOutcome::Failed { .. } => EXIT_FAILURE,
        }
    }
}

/// Human-readable class of an Updater exit, for supervisor logs
pub fn describe_exit(status: ChildExit) -> String {
    match status {
        ChildExit::Code(EXIT_APPLIED) => "update applied".to_string(),
        ChildExit::Code(EXIT_FAILURE) => "generic failure (exit 1)".to_string(),
        ChildExit::Code(EXIT_ARCHIVE_REJECTED) => "archive rejected, image intact (exit 2)".to_string(),
        ChildExit::Code(EXIT_IMAGE_LOST) => "archive rejected, program image lost (exit 3)".to_string(),
        other => other.to_string(),
    }
}

/// Starts the updated program once it is installed
pub trait SuccessorLauncher {
    /// Launch `image` as a new, independent supervisor; returns its pid
    fn launch(&mut self, image: &ProgramImage) -> Result<u32>;
}

/// Runs `<entry_point> [--config PATH] supervise` in a new session
pub struct DetachedSuccessor {
    config_path: Option<PathBuf>,
}

impl DetachedSuccessor {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self { config_path }
    }
}

impl SuccessorLauncher for DetachedSuccessor {
    fn launch(&mut self, image: &ProgramImage) -> Result<u32> {
        let mut cmd = Command::new(image.entry_point());
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("supervise")
            .current_dir(image.base_dir())
            .stdin(Stdio::null());
        spawn_detached(&mut cmd)
    }
}

pub struct Updater<S: ArtifactSource, L: SuccessorLauncher> {
    source: S,
    launcher: L,
    image: ProgramImage,
    source_url: String,
    poll_interval: Duration,
    strategy: InstallStrategy,
    pause: Box<dyn FnMut(Duration)>,
    state: UpdaterState,
    transitions: Vec<UpdaterState>,
    attempts: u32,
}

impl<S: ArtifactSource, L: SuccessorLauncher> Updater<S, L> {
    pub fn new(
        source: S,
        launcher: L,
        image: ProgramImage,
        update_source: &UpdateSource,
        strategy: InstallStrategy,
    ) -> Self {
        Self {
            source,
            launcher,
            image,
            source_url: update_source.url.clone(),
            poll_interval: update_source.poll_interval,
            strategy,
            pause: Box::new(std::thread::sleep),
            state: UpdaterState::Idle,
            transitions: vec![UpdaterState::Idle],
            attempts: 0,
        }
    }

    /// Replace the sleep between polls
    pub fn with_pause(mut self, pause: impl FnMut(Duration) + 'static) -> Self {
        self.pause = Box::new(pause);
        self
    }

    pub fn state(&self) -> UpdaterState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn transitions(&self) -> &[UpdaterState] {
        &self.transitions
    }

    /// Download attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    fn enter(&mut self, state: UpdaterState) {
        debug!("Updater: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.transitions.push(state);
    }

    /// Poll until an archive is installed or installation fails
    pub fn run(&mut self) -> UpdateOutcome {
        let staging = self.image.staging_archive();
        (self.pause)(self.poll_interval);

        loop {
            self.enter(UpdaterState::Polling);
            match clear_staging(&staging) {
                Ok(true) => info!("Removed leftover staging archive {}", staging.display()),
                Ok(false) => {}
                Err(e) => {
                    return UpdateOutcome::Failed {
                        reason: format!("cannot clear staging path {}: {}", staging.display(), e),
                    }
                }
            }
            match clear_scratch(self.image.base_dir()) {
                Ok(0) => {}
                Ok(n) => info!("Removed {} stale scratch directories from an interrupted install", n),
                Err(e) => {
                    return UpdateOutcome::Failed {
                        reason: format!("cannot clear extraction scratch space: {}", e),
                    }
                }
            }

            self.attempts += 1;
            self.enter(UpdaterState::Downloading);
            match self.source.fetch(&staging) {
                Ok(artifact) => return self.apply(artifact),
                Err(FetchError::NotModified) => {
                    debug!("No new archive at {}", self.source_url);
                }
                Err(e) if e.is_transient() => {
                    info!("Update check failed (attempt {}): {}", self.attempts, e);
                }
                Err(e) => {
                    return UpdateOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            }

            self.enter(UpdaterState::Idle);
            (self.pause)(self.poll_interval);
        }
    }

    fn apply(&mut self, artifact: StagingArtifact) -> UpdateOutcome {
        info!("📦  Downloaded update from {}", self.source_url);
        let entry_point = self.image.relative_entry_point().to_path_buf();

        let installed = match self.strategy {
            InstallStrategy::ValidateThenSwap => self.validate_then_swap(&artifact, &entry_point),
            InstallStrategy::DeleteThenExtract => self.delete_then_extract(&artifact, &entry_point),
        };

        if let Err(e) = installed {
            if let Err(discard) = artifact.discard() {
                warn!("Failed to remove staged archive: {}", discard);
            }
            return UpdateOutcome::ArchiveRejected {
                reason: e.to_string(),
                image_intact: self.image.entry_point().exists(),
            };
        }

        let validators = artifact.validators().clone();
        if let Err(e) = artifact.discard() {
            warn!("Failed to remove staged archive: {}", e);
        }

        self.enter(UpdaterState::Launching);
        let successor_pid = match self.launcher.launch(&self.image) {
            Ok(pid) => pid,
            Err(e) => {
                return UpdateOutcome::Failed {
                    reason: format!("cannot launch successor: {:#}", e),
                }
            }
        };

        // Only a running successor makes the installed archive current
        let record = UpdateRecord::new(&self.source_url, validators);
        if let Err(e) = record.save(&self.image.update_record_path()) {
            warn!("Failed to save update record: {}", e);
        }

        self.enter(UpdaterState::Done);
        UpdateOutcome::Applied { successor_pid }
    }

    fn validate_then_swap(&mut self, artifact: &StagingArtifact, entry_point: &Path) -> Result<(), FetchError> {
        self.enter(UpdaterState::Extracting);
        let tree = extract_to_scratch(artifact, entry_point)?;

        self.enter(UpdaterState::Replacing);
        let moved = tree.swap_into_place()?;
        info!("Installed {} files into {}", moved, self.image.base_dir().display());
        Ok(())
    }

    fn delete_then_extract(&mut self, artifact: &StagingArtifact, entry_point: &Path) -> Result<(), FetchError> {
        self.enter(UpdaterState::Replacing);
        remove_entry_point(artifact, entry_point)?;

        self.enter(UpdaterState::Extracting);
        extract_in_place(artifact, entry_point)
    }
}

/// Entry point of the `updater` role; returns the process exit code
pub fn run_updater(config: &Config, image: ProgramImage, config_path: Option<PathBuf>) -> i32 {
    let Some(source) = config.update_source() else {
        error!("Updater started without an update URL");
        return EXIT_FAILURE;
    };

    let record = UpdateRecord::load(&image.update_record_path());
    let fetcher = HttpFetcher::new(
        source.clone(),
        config.update.request_timeout(),
        config.update.connect_timeout(),
    )
    .with_validators(UpdateRecord::validators_for(record.as_ref(), &source.url));

    info!(
        "🔄  Polling {} every {:?} ({:?})",
        source.url, source.poll_interval, config.update.install_strategy
    );
    let mut updater = Updater::new(
        fetcher,
        DetachedSuccessor::new(config_path),
        image,
        &source,
        config.update.install_strategy,
    );

    let outcome = updater.run();
    match &outcome {
        UpdateOutcome::Applied { successor_pid } => {
            info!("✅  Update applied; successor running as pid {}", successor_pid)
        }
        UpdateOutcome::ArchiveRejected { reason, image_intact } => {
            error!("❌  Archive rejected (image intact: {}): {}", image_intact, reason)
        }
        UpdateOutcome::Failed { reason } => error!("❌  Update failed: {}", reason),
    }
    outcome.exit_code()
}
