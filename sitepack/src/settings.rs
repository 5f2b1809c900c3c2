//! Global settings.
//!
//! Settings are loaded once when the process starts and stay immutable
//! for the whole build or transfer run. Components that need them take
//! a reference explicitly.

use serde::Deserialize;

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Number of failed attempts tolerated per storage.
    ///
    /// The upload to a storage is marked as failed once the failure
    /// count exceeds this value.
    #[serde(rename = "max-storage-retries")]
    #[serde(default = "default_max_storage_retries")]
    pub max_storage_retries: u32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            max_storage_retries: default_max_storage_retries(),
        }
    }
}

fn default_max_storage_retries() -> u32 {
    10
}
