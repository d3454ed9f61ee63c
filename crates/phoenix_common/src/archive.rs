//! Extraction of a staged update archive over the program's base directory.
//!
//! Two orderings are supported:
//! - validate-then-swap: unpack into a scratch directory inside the base
//!   directory, check the entry point, then `rename` each file into place
//!   with the entry point last. Any failure leaves the old entry point alone.
//! - delete-then-extract: remove the entry point, then unpack directly over
//!   the base directory. A bad archive leaves no program image on disk.

use crate::error::FetchError;
use crate::fetcher::StagingArtifact;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const SCRATCH_PREFIX: &str = ".phoenix-extract-";

/// An archive unpacked into a scratch directory and checked
#[derive(Debug)]
pub struct ExtractedTree {
    scratch: TempDir,
    target: PathBuf,
    entry_point: PathBuf,
}

impl ExtractedTree {
    /// Move every extracted file over its counterpart in the target.
    ///
    /// The entry point is renamed last, so a failure part way through leaves
    /// the old entry point in place. Returns the number of files moved.
    pub fn swap_into_place(self) -> Result<usize, FetchError> {
        let scratch = self.scratch.path();
        let mut files = Vec::new();

        for entry in WalkDir::new(scratch).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| corrupt("cannot walk extracted tree", e))?;
            let relative = entry
                .path()
                .strip_prefix(scratch)
                .map_err(|e| corrupt("extracted path escaped scratch directory", e))?
                .to_path_buf();

            if entry.file_type().is_dir() {
                let target = self.target.join(&relative);
                if fs::symlink_metadata(&target).is_ok_and(|m| !m.is_dir()) {
                    fs::remove_file(&target).map_err(|e| corrupt("cannot replace file with directory", e))?;
                }
                fs::create_dir_all(&target).map_err(|e| corrupt("cannot create directory", e))?;
            } else {
                files.push(relative);
            }
        }

        // false sorts before true, so the entry point goes last
        files.sort_by_key(|relative| *relative == self.entry_point);

        for relative in &files {
            let from = scratch.join(relative);
            let to = self.target.join(relative);
            if fs::symlink_metadata(&to).is_ok_and(|m| m.is_dir()) {
                fs::remove_dir_all(&to).map_err(|e| corrupt("cannot replace directory with file", e))?;
            }
            fs::rename(&from, &to).map_err(|e| {
                corrupt(&format!("cannot move {} into place", relative.display()), e)
            })?;
            debug!("Installed {}", to.display());
        }

        info!(
            "Swapped {} file(s) into {}",
            files.len(),
            self.target.display()
        );
        Ok(files.len())
    }
}

/// Unpack into a scratch directory next to the target and check the entry point.
///
/// Nothing outside the scratch directory is touched.
pub fn extract_to_scratch(
    artifact: &StagingArtifact,
    entry_point: &Path,
) -> Result<ExtractedTree, FetchError> {
    let target = artifact.extract_root().to_path_buf();
    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir_in(&target)
        .map_err(|e| corrupt("cannot create scratch directory", e))?;

    unpack(artifact.archive_path(), scratch.path())?;
    check_entry_point(&scratch.path().join(entry_point), entry_point)?;

    Ok(ExtractedTree {
        scratch,
        target,
        entry_point: entry_point.to_path_buf(),
    })
}

/// Remove scratch directories left in `root` by an interrupted extraction.
///
/// Returns the number of directories removed.
pub fn clear_scratch(root: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let is_scratch = entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX);
        if !is_scratch || !entry.file_type()?.is_dir() {
            continue;
        }
        fs::remove_dir_all(entry.path())?;
        debug!("Removed stale scratch directory {}", entry.path().display());
        removed += 1;
    }
    Ok(removed)
}

/// Remove the current entry point ahead of an in-place extraction
pub fn remove_entry_point(artifact: &StagingArtifact, entry_point: &Path) -> io::Result<()> {
    let path = artifact.extract_root().join(entry_point);
    match fs::remove_file(&path) {
        Ok(()) => {
            warn!("Removed current program image {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Unpack directly over the extract root, overwriting files of the same name
pub fn extract_in_place(artifact: &StagingArtifact, entry_point: &Path) -> Result<(), FetchError> {
    let root = artifact.extract_root();
    unpack(artifact.archive_path(), root)?;
    check_entry_point(&root.join(entry_point), entry_point)?;
    info!("Extracted {} over {}", artifact.archive_path().display(), root.display());
    Ok(())
}

fn unpack(archive: &Path, destination: &Path) -> Result<(), FetchError> {
    let file = File::open(archive)
        .map_err(|e| corrupt(&format!("cannot open {}", archive.display()), e))?;

    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    tar.unpack(destination)
        .map_err(|e| corrupt(&format!("failed to extract {}", archive.display()), e))
}

fn check_entry_point(path: &Path, relative: &Path) -> Result<(), FetchError> {
    let meta = fs::symlink_metadata(path).map_err(|_| {
        FetchError::CorruptArchive(format!(
            "archive does not contain entry point {}",
            relative.display()
        ))
    })?;
    if !meta.is_file() {
        return Err(FetchError::CorruptArchive(format!(
            "entry point {} is not a regular file",
            relative.display()
        )));
    }
    set_executable(path).map_err(|e| corrupt("cannot mark entry point executable", e))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> FetchError {
    FetchError::CorruptArchive(format!("{}: {}", what, err))
}
