//! Configuration management for phoenix.
//!
//! Loads settings from /etc/phoenix/config.toml or uses defaults. The update
//! URL is taken from the AUTO_UPDATE_URL environment variable when present,
//! which overrides `[update].url` from the file.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/phoenix/config.toml";

/// Environment variable holding the update source URL
pub const UPDATE_URL_ENV: &str = "AUTO_UPDATE_URL";

/// Order in which the updater replaces the on-disk program image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstallStrategy {
    /// Unpack into a scratch directory, check the entry point, then rename
    /// every file into place with the entry point last.
    #[default]
    ValidateThenSwap,
    /// Delete the entry point, then unpack over the base directory. A bad
    /// archive leaves no runnable image behind.
    DeleteThenExtract,
}

/// Where and how often to look for a new build.
///
/// Built once at startup; absent when no URL is configured, which disables
/// the updater role entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSource {
    pub url: String,
    pub poll_interval: Duration,
}

/// Update channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Archive URL (overridden by AUTO_UPDATE_URL)
    #[serde(default)]
    pub url: Option<String>,

    /// Seconds between fetch attempts
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub install_strategy: InstallStrategy,

    /// Whole-request timeout for one download
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    15
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            url: None,
            poll_interval_secs: default_poll_interval(),
            install_strategy: InstallStrategy::default(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl UpdateConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Service worker listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9999
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

/// Supervisor restart policy and daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Log file for the detached process tree (default: <base_dir>/phoenixd.log)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Delay before the second consecutive rapid restart of a role
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fraction of the delay added as random jitter (0.0 - 1.0)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// A child that lives this long counts as a healthy run
    #[serde(default = "default_healthy_after")]
    pub healthy_after_secs: u64,

    /// Consecutive short-lived runs before a role is held off
    #[serde(default = "default_max_rapid_restarts")]
    pub max_rapid_restarts: u32,

    /// How long a role is held off once the restart circuit opens
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_secs: u64,
}

fn default_initial_backoff() -> u64 {
    250
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    0.1
}

fn default_healthy_after() -> u64 {
    10
}

fn default_max_rapid_restarts() -> u32 {
    10
}

fn default_circuit_cooldown() -> u64 {
    60
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_jitter: default_backoff_jitter(),
            healthy_after_secs: default_healthy_after(),
            max_rapid_restarts: default_max_rapid_restarts(),
            circuit_cooldown_secs: default_circuit_cooldown(),
        }
    }
}

/// Complete phoenix configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Load config and apply the environment override.
    ///
    /// An explicitly given path must exist and parse. Without one, the
    /// system path is tried and defaults are used when it is missing.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load_from_path(path)?,
            None => match Self::load_from_path(Path::new(CONFIG_PATH)) {
                Ok(config) => config,
                Err(ConfigError::Read { .. }) => {
                    info!("No config at {}, using defaults", CONFIG_PATH);
                    Config::default()
                }
                Err(e) => return Err(e),
            },
        };

        config.apply_env(std::env::var(UPDATE_URL_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load config from specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Override the update URL from the environment value, if non-empty
    pub fn apply_env(&mut self, env_url: Option<String>) {
        if let Some(url) = env_url.map(|u| u.trim().to_string()) {
            if url.is_empty() {
                warn!("{} is set but empty, ignoring", UPDATE_URL_ENV);
            } else {
                self.update.url = Some(url);
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.update.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "update.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        let multiplier = self.supervisor.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "supervisor.backoff_multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.supervisor.backoff_jitter) {
            return Err(ConfigError::Invalid(
                "supervisor.backoff_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// The update source, or `None` when the updater role is disabled
    pub fn update_source(&self) -> Option<UpdateSource> {
        let url = self.update.url.as_deref().map(str::trim)?;
        if url.is_empty() {
            return None;
        }
        Some(UpdateSource {
            url: url.to_string(),
            poll_interval: Duration::from_secs(self.update.poll_interval_secs),
        })
    }
}
