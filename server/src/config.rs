//! Server configuration.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::Deserialize;
use xdg::BaseDirectories;

use crate::storage::{LocalStorageConfig, S3StorageConfig};
use sitepack::settings::GlobalSettings;

/// Application prefix in XDG base directories.
///
/// This will be concatenated into `$XDG_CONFIG_HOME/sitepack`.
const XDG_PREFIX: &str = "sitepack";

/// Environment variable holding a base64-encoded configuration.
const ENV_CONFIG_BASE64: &str = "SITEPACK_SERVER_TOML_BASE64";

/// Configuration for the sitepack daemon and tools.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding the package records.
    #[serde(rename = "store-path")]
    pub store_path: PathBuf,

    /// Directory the archive builder writes its fragments to.
    #[serde(rename = "temp-path")]
    pub temp_path: PathBuf,

    /// Global settings.
    #[serde(default = "Default::default")]
    pub settings: GlobalSettings,

    /// Transfer scheduling.
    #[serde(default = "Default::default")]
    pub transfer: TransferConfig,

    /// Configured storages.
    #[serde(rename = "storage")]
    #[serde(default = "Vec::new")]
    pub storages: Vec<StorageConfig>,
}

/// Transfer scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    /// Time budget of one chunk.
    #[serde(rename = "max-chunk-time")]
    #[serde(with = "humantime_serde", default = "default_max_chunk_time")]
    pub max_chunk_time: Duration,

    /// Pause between two buffers of a chunk, to spare the host.
    #[serde(rename = "load-delay")]
    #[serde(with = "humantime_serde", default = "default_load_delay")]
    pub load_delay: Duration,

    /// Delay between the two reads of the source position once a chunk
    /// is done.
    #[serde(rename = "settle-delay")]
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,

    /// How many times the source position is checked before giving up.
    #[serde(rename = "settle-attempts")]
    #[serde(default = "default_settle_attempts")]
    pub settle_attempts: u32,

    /// Pause between two transfer passes of the daemon.
    ///
    /// If zero, the daemon runs a single pass.
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
}

/// A configured storage.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Storage ID referenced by upload records.
    pub id: i64,

    /// Display name.
    pub name: String,

    /// Folder inside the storage to put packages in.
    #[serde(default = "String::new")]
    pub folder: String,

    /// Backend configuration.
    #[serde(flatten)]
    pub backend: StorageBackendConfig,
}

/// Backend configuration of a storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StorageBackendConfig {
    /// Local file storage.
    #[serde(rename = "local")]
    Local(LocalStorageConfig),

    /// S3 storage.
    #[serde(rename = "s3")]
    S3(S3StorageConfig),
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_chunk_time: default_max_chunk_time(),
            load_delay: default_load_delay(),
            settle_delay: default_settle_delay(),
            settle_attempts: default_settle_attempts(),
            interval: default_interval(),
        }
    }
}

impl Config {
    /// Checks what deserialization can't.
    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for storage in &self.storages {
            if storage.id < 0 {
                return Err(anyhow!("Storage \"{}\" has a negative id", storage.name));
            }

            if !ids.insert(storage.id) {
                return Err(anyhow!("Storage id {} is configured more than once", storage.id));
            }
        }

        if self.transfer.settle_attempts == 0 {
            return Err(anyhow!("settle-attempts must be at least 1"));
        }

        Ok(())
    }
}

fn default_max_chunk_time() -> Duration {
    Duration::from_secs(20)
}

fn default_load_delay() -> Duration {
    Duration::ZERO
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_settle_attempts() -> u32 {
    3
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

pub fn load_config_from_path(path: &Path) -> Result<Config> {
    tracing::info!("Using configurations: {:?}", path);

    let config = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {:?}", path))?;
    load_config_from_str(&config)
}

pub fn load_config_from_str(s: &str) -> Result<Config> {
    let config: Config = toml::from_str(s).context("Invalid configuration file")?;
    config.validate()?;

    Ok(config)
}

/// Loads the configuration.
///
/// The explicit path wins, then the environment variable, then the
/// XDG configuration file.
pub async fn load_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return load_config_from_path(path);
    }

    if let Ok(encoded) = env::var(ENV_CONFIG_BASE64) {
        tracing::info!("Using configurations from environment variable");
        let decoded = BASE64_STANDARD
            .decode(encoded.as_bytes())
            .context("Invalid base64 in configuration variable")?;
        let s = String::from_utf8(decoded)?;
        return load_config_from_str(&s);
    }

    let path = get_xdg_config_path()?;
    load_config_from_path(&path)
}

pub fn get_xdg_config_path() -> anyhow::Result<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX)?;
    let config_path = xdg_dirs.place_config_file("server.toml")?;

    Ok(config_path)
}
