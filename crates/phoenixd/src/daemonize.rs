//! Detach the supervisor from the invoking shell

use crate::process::spawn_detached;
use anyhow::{Context, Result};
use phoenix_common::ProgramImage;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Re-run the image as `supervise` in a new session, logging to `log_file`.
///
/// Returns the pid of the detached supervisor. Its children inherit the log
/// file as stdout and stderr.
pub fn detach(image: &ProgramImage, config_path: Option<&Path>, log_file: &Path) -> Result<u32> {
    if let Some(dir) = log_file.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    }

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file: {}", log_file.display()))?;

    let mut cmd = Command::new(image.entry_point());
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.arg("supervise")
        .current_dir(image.base_dir())
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log);

    spawn_detached(&mut cmd)
}

/// Log file from config, or `<base_dir>/phoenixd.log`
pub fn log_file_path(configured: Option<&Path>, image: &ProgramImage) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .unwrap_or_else(|| image.default_log_file())
}
