//! Phoenix Common - configuration, artifact fetching and archive installation
//! shared by the supervisor, updater and worker roles.

pub mod archive;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod image;
pub mod update_state;

pub use config::{Config, InstallStrategy, UpdateSource};
pub use error::{ConfigError, FetchError};
pub use fetcher::{clear_staging, fetch, ArtifactSource, HttpFetcher, StagingArtifact, Validators};
pub use image::ProgramImage;
pub use update_state::UpdateRecord;
