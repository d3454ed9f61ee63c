//! Update record - which archive was applied last.
//!
//! Stored as JSON in the base directory. The successor of an update reads it
//! to make its polls conditional, so it does not re-install the very archive
//! it was built from.

use crate::fetcher::Validators;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// URL the archive was fetched from
    pub source_url: String,
    #[serde(flatten)]
    pub validators: Validators,
    pub applied_at: DateTime<Utc>,
    /// Version of the program that applied the update
    pub applied_by: String,
}

impl UpdateRecord {
    pub fn new(source_url: &str, validators: Validators) -> Self {
        Self {
            source_url: source_url.to_string(),
            validators,
            applied_at: Utc::now(),
            applied_by: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Load a record from disk; missing or unreadable files yield `None`
    pub fn load(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Ignoring unreadable update record {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Validators to send when polling `url`; empty if the record is for another source
    pub fn validators_for(record: Option<&Self>, url: &str) -> Validators {
        record
            .filter(|r| r.source_url == url)
            .map(|r| r.validators.clone())
            .unwrap_or_default()
    }

    /// Save atomically (write sibling temp file, then rename)
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)
    }
}
