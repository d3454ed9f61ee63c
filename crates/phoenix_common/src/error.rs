//! Error types for phoenix.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of a fetch or install attempt.
///
/// `Unreachable` and `NotModified` are the only transient variants; the
/// updater retries them forever at its poll interval.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Update source unreachable: {0}")]
    Unreachable(String),

    #[error("Update source reports no change since the last applied archive")]
    NotModified,

    #[error("Staging path already exists: {}", .0.display())]
    StagingOccupied(PathBuf),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether the updater should sleep and try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Unreachable(_) | FetchError::NotModified)
    }
}

/// Failure loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
