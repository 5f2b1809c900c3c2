//! Storage backends.
//!
//! A backend moves one bounded chunk of a local file per call. Everything
//! it needs to resume lives in the [`UploadInfo`] of the destination, so
//! a transfer survives process restarts.

mod local;
mod s3;


use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::time;

use crate::config::{StorageBackendConfig, StorageConfig, TransferConfig};
use crate::error::{ServerError, ServerResult};
use sitepack::upload::{StorageLabels, StorageLookup, UploadInfo};

pub use self::local::{LocalBackend, LocalStorageConfig};
pub use self::s3::{S3Backend, S3StorageConfig};

/// Way to download a file.
pub enum Download {
    /// A stream.
    Stream(Box<dyn AsyncRead + Unpin + Send>),
}

/// Identity of a configured storage, shared by all backends.
#[derive(Debug, Clone)]
pub struct StorageIdentity {
    pub id: i64,
    pub name: String,

    /// Folder inside the storage. Empty means the root.
    pub folder: String,
}

/// Time limits of one chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    /// Budget of the whole call, measured from its start.
    pub max_time: Duration,

    /// Pause between two buffers.
    pub load_delay: Duration,

    pub settle_delay: Duration,
    pub settle_attempts: u32,
}

/// One chunk to move.
pub struct ChunkRequest<'a> {
    /// Local file to copy.
    pub source: &'a Path,

    /// Name of the file inside the storage folder.
    pub name: &'a str,

    pub limits: ChunkLimits,

    /// Upload record of the destination.
    ///
    /// `offset` is where the chunk starts. The backend may keep its own
    /// continuation in `data`, `data2` and `chunk_position`.
    pub upload: &'a mut UploadInfo,
}

/// Result of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Offset the next chunk starts at.
    pub next_offset: u64,

    /// Whether the chunk was moved.
    pub success: bool,

    /// Whether the whole file is now in the storage.
    pub completed: bool,

    pub error_details: Option<String>,

    /// Whether retrying is pointless.
    pub fatal_error: bool,
}

/// A storage backend.
#[async_trait::async_trait]
pub trait StorageBackend: StorageLabels + Send + Sync + std::fmt::Debug {
    /// Returns the identity of the storage.
    fn identity(&self) -> &StorageIdentity;

    /// Gets the storage ready for a transfer.
    async fn open(&self) -> ServerResult<()>;

    /// Moves one chunk of a file.
    ///
    /// Transient problems are returned as errors or as an unsuccessful
    /// outcome, and the caller counts them against the retry budget.
    async fn upload_chunk(&self, req: ChunkRequest<'_>) -> ServerResult<ChunkOutcome>;

    /// Throws away the unfinished copy of a file.
    ///
    /// Called once an upload stops for good without finishing. Any
    /// continuation the backend kept in `upload` is released as well.
    async fn abort(&self, name: &str, upload: &UploadInfo) -> ServerResult<()>;

    /// Deletes a file.
    async fn delete_file(&self, name: &str) -> ServerResult<()>;

    /// Lists the files in the storage folder.
    async fn list_files(&self) -> ServerResult<Vec<String>>;

    /// Downloads a file.
    async fn download_file(&self, name: &str) -> ServerResult<Download>;

    /// Checks that the storage accepts, returns and deletes a file.
    async fn test(&self) -> ServerResult<()>;
}

/// The configured storages, keyed by ID.
#[derive(Debug, Default)]
pub struct StorageRegistry {
    backends: BTreeMap<i64, Arc<dyn StorageBackend>>,
}

impl ChunkLimits {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_time: config.max_chunk_time,
            load_delay: config.load_delay,
            settle_delay: config.settle_delay,
            settle_attempts: config.settle_attempts,
        }
    }
}

impl ChunkOutcome {
    /// The whole file is in the storage.
    pub fn completed(size: u64) -> Self {
        Self {
            next_offset: size,
            success: true,
            completed: true,
            error_details: None,
            fatal_error: false,
        }
    }

    /// The time budget ran out, resume at `next_offset`.
    pub fn partial(next_offset: u64) -> Self {
        Self {
            next_offset,
            success: true,
            completed: false,
            error_details: None,
            fatal_error: false,
        }
    }

    /// The chunk failed but may be retried from `next_offset`.
    pub fn failed(next_offset: u64, details: impl Into<String>) -> Self {
        Self {
            next_offset,
            success: false,
            completed: false,
            error_details: Some(details.into()),
            fatal_error: false,
        }
    }

    /// The upload can't go on.
    pub fn fatal(details: impl Into<String>) -> Self {
        Self {
            next_offset: 0,
            success: false,
            completed: false,
            error_details: Some(details.into()),
            fatal_error: true,
        }
    }
}

impl StorageIdentity {
    /// Returns the path of a file relative to the storage root.
    pub fn path_in_folder(&self, name: &str) -> String {
        let folder = self.folder.trim_matches('/');
        if folder.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", folder, name)
        }
    }
}

impl StorageRegistry {
    /// Creates the backends of the configured storages.
    pub async fn from_config(storages: &[StorageConfig]) -> ServerResult<Self> {
        let mut registry = Self::default();

        for storage in storages {
            let identity = StorageIdentity {
                id: storage.id,
                name: storage.name.clone(),
                folder: storage.folder.clone(),
            };

            let backend: Arc<dyn StorageBackend> = match &storage.backend {
                StorageBackendConfig::Local(local_config) => {
                    Arc::new(LocalBackend::new(identity, local_config.clone()))
                }
                StorageBackendConfig::S3(s3_config) => {
                    Arc::new(S3Backend::new(identity, s3_config.clone()).await?)
                }
            };

            registry.insert(backend)?;
        }

        Ok(registry)
    }

    pub fn insert(&mut self, backend: Arc<dyn StorageBackend>) -> ServerResult<()> {
        let id = backend.identity().id;
        if self.backends.contains_key(&id) {
            return Err(ServerError::DuplicateStorage { id });
        }

        self.backends.insert(id, backend);
        Ok(())
    }

    pub fn get(&self, id: i64) -> Option<&Arc<dyn StorageBackend>> {
        self.backends.get(&id)
    }
}

impl StorageLookup for StorageRegistry {
    fn labels(&self, storage_id: i64) -> Option<&dyn StorageLabels> {
        self.backends
            .get(&storage_id)
            .map(|backend| backend.as_ref() as &dyn StorageLabels)
    }
}

/// Opens the source of a chunk, positioned at `offset`.
///
/// A source that can't be positioned is fatal for the upload.
pub(crate) async fn open_source(path: &Path, offset: u64) -> Result<(File, u64), ChunkOutcome> {
    let mut file = File::open(path)
        .await
        .map_err(|e| ChunkOutcome::fatal(format!("Cannot open {:?}: {}", path, e)))?;

    let size = file
        .metadata()
        .await
        .map_err(|e| ChunkOutcome::fatal(format!("Cannot stat {:?}: {}", path, e)))?
        .len();

    if offset > size {
        return Err(ChunkOutcome::fatal(format!(
            "Offset {} is past the end of {:?} ({} bytes)",
            offset, path, size
        )));
    }

    let position = file
        .seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| ChunkOutcome::fatal(format!("Cannot seek {:?}: {}", path, e)))?;

    if position != offset {
        return Err(ChunkOutcome::fatal(format!(
            "Seeking {:?} to {} landed at {}",
            path, offset, position
        )));
    }

    Ok((file, size))
}

/// Waits for the source position to stop moving.
///
/// The position is read twice, `settle_delay` apart, up to
/// `settle_attempts` times. Returns the settled position.
async fn settle_position(file: &mut File, limits: &ChunkLimits) -> Option<u64> {
    for attempt in 1..=limits.settle_attempts.max(1) {
        let first = file.stream_position().await.ok()?;
        if !limits.settle_delay.is_zero() {
            time::sleep(limits.settle_delay).await;
        }
        let second = file.stream_position().await.ok()?;

        if first == second {
            return Some(second);
        }

        tracing::debug!(attempt, first, second, "Source position still moving");
    }

    None
}

/// Checks that the source stopped moving exactly at `expected`.
pub(crate) async fn ensure_settled(
    file: &mut File,
    limits: &ChunkLimits,
    expected: u64,
) -> Result<(), ChunkOutcome> {
    match settle_position(file, limits).await {
        Some(settled) if settled == expected => Ok(()),
        Some(settled) => {
            tracing::error!(settled, expected, "Source changed while copying");
            Err(ChunkOutcome::fatal(format!(
                "Source position settled at {} instead of {}",
                settled, expected
            )))
        }
        None => {
            tracing::error!(expected, "Source position never settled");
            Err(ChunkOutcome::fatal("Source position never settled"))
        }
    }
}

/// Greedily reads from a stream to fill a buffer.
pub(crate) async fn read_chunk_async<S: AsyncRead + Unpin + Send>(
    stream: &mut S,
    mut chunk: BytesMut,
) -> std::io::Result<Bytes> {
    while chunk.len() < chunk.capacity() {
        let read = stream.read_buf(&mut chunk).await?;

        if read == 0 {
            break;
        }
    }

    Ok(chunk.freeze())
}
