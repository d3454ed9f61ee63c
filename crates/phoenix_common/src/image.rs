//! The running program's on-disk image.

use std::io;
use std::path::{Path, PathBuf};

/// Staged download, kept next to the tree it will be unpacked into
pub const STAGING_ARCHIVE_NAME: &str = ".phoenix-update.tar.gz";

/// Validators of the last applied archive
pub const UPDATE_RECORD_NAME: &str = ".phoenix-update.json";

/// Default log file for the detached process tree
pub const LOG_FILE_NAME: &str = "phoenixd.log";

/// Base directory plus entry-point executable.
///
/// Resolved once at startup. After a swap the path still names the entry
/// point even though the running process holds the old inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage {
    base_dir: PathBuf,
    entry_point: PathBuf,
}

impl ProgramImage {
    /// Image of the currently running executable
    pub fn current() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        let exe = exe.canonicalize().unwrap_or(exe);
        Self::from_entry_point(exe)
    }

    /// Image whose base directory is the parent of `entry_point`
    pub fn from_entry_point(entry_point: impl Into<PathBuf>) -> io::Result<Self> {
        let entry_point = entry_point.into();
        let base_dir = entry_point
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("entry point {} has no parent directory", entry_point.display()),
                )
            })?;
        Ok(Self {
            base_dir,
            entry_point,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn entry_point(&self) -> &Path {
        &self.entry_point
    }

    /// Entry point path inside an update archive
    pub fn relative_entry_point(&self) -> &Path {
        self.entry_point
            .strip_prefix(&self.base_dir)
            .unwrap_or(&self.entry_point)
    }

    pub fn staging_archive(&self) -> PathBuf {
        self.base_dir.join(STAGING_ARCHIVE_NAME)
    }

    pub fn update_record_path(&self) -> PathBuf {
        self.base_dir.join(UPDATE_RECORD_NAME)
    }

    pub fn default_log_file(&self) -> PathBuf {
        self.base_dir.join(LOG_FILE_NAME)
    }
}
