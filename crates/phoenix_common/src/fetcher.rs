//! Artifact fetcher - one blocking download of the update archive.
//!
//! Downloading and extracting are separate steps so "source unreachable" and
//! "archive corrupt" stay distinguishable. See `archive` for extraction.

use crate::config::UpdateSource;
use crate::error::FetchError;
use reqwest::header::{HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("phoenixd/", env!("CARGO_PKG_VERSION"));

/// HTTP cache validators identifying one version of the archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl Validators {
    fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            etag: read(ETAG),
            last_modified: read(LAST_MODIFIED),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// A downloaded archive waiting to be extracted
#[derive(Debug)]
pub struct StagingArtifact {
    archive_path: PathBuf,
    extract_root: PathBuf,
    validators: Validators,
}

impl StagingArtifact {
    pub fn new(archive_path: PathBuf, extract_root: PathBuf, validators: Validators) -> Self {
        Self {
            archive_path,
            extract_root,
            validators,
        }
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn extract_root(&self) -> &Path {
        &self.extract_root
    }

    pub fn validators(&self) -> &Validators {
        &self.validators
    }

    /// Remove the staged archive once it has been consumed or rejected
    pub fn discard(self) -> io::Result<()> {
        clear_staging(&self.archive_path).map(|_| ())
    }
}

/// Something that can produce a staged update archive
pub trait ArtifactSource {
    /// One download attempt into `destination`, which must not exist yet
    fn fetch(&self, destination: &Path) -> Result<StagingArtifact, FetchError>;
}

/// Blocking HTTP(S) fetcher for an `UpdateSource`
pub struct HttpFetcher {
    source: UpdateSource,
    client: reqwest::blocking::Client,
    known: Validators,
}

impl HttpFetcher {
    pub fn new(source: UpdateSource, request_timeout: Duration, connect_timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_default();

        Self {
            source,
            client,
            known: Validators::default(),
        }
    }

    /// Make requests conditional on the archive having changed
    pub fn with_validators(mut self, known: Validators) -> Self {
        self.known = known;
        self
    }
}

impl ArtifactSource for HttpFetcher {
    fn fetch(&self, destination: &Path) -> Result<StagingArtifact, FetchError> {
        if fs::symlink_metadata(destination).is_ok() {
            return Err(FetchError::StagingOccupied(destination.to_path_buf()));
        }

        let mut request = self.client.get(&self.source.url);
        if let Some(etag) = &self.known.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &self.known.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let mut response = request
            .send()
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!("{} not modified", self.source.url);
            return Err(FetchError::NotModified);
        }
        if !status.is_success() {
            return Err(FetchError::Unreachable(format!(
                "{} returned {}",
                self.source.url, status
            )));
        }

        let validators = Validators::from_headers(response.headers());

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(destination)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(FetchError::StagingOccupied(destination.to_path_buf()));
            }
            Err(e) => return Err(FetchError::Io(e)),
        };

        let written = io::copy(&mut response, &mut file).and_then(|n| {
            file.flush()?;
            file.sync_all()?;
            Ok(n)
        });
        drop(file);

        let bytes = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(remove) = fs::remove_file(destination) {
                    warn!(
                        "Failed to remove partial download {}: {}",
                        destination.display(),
                        remove
                    );
                }
                return Err(FetchError::Unreachable(format!(
                    "download of {} interrupted: {}",
                    self.source.url, e
                )));
            }
        };

        info!(
            "Downloaded {} bytes from {} to {}",
            bytes,
            self.source.url,
            destination.display()
        );

        let extract_root = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(StagingArtifact::new(
            destination.to_path_buf(),
            extract_root,
            validators,
        ))
    }
}

/// One download attempt of `source.url` into `destination`
pub fn fetch(source: &UpdateSource, destination: &Path) -> Result<StagingArtifact, FetchError> {
    HttpFetcher::new(
        source.clone(),
        Duration::from_secs(300),
        Duration::from_secs(15),
    )
    .fetch(destination)
}

/// Remove a leftover staged archive. Returns whether anything was removed.
pub fn clear_staging(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map(|_| true),
        Ok(_) => fs::remove_file(path).map(|_| true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
