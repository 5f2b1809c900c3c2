//! Local file storage.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::Deserialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time;

use super::{
    ensure_settled, open_source, read_chunk_async, ChunkOutcome, ChunkRequest, Download,
    StorageBackend, StorageIdentity,
};
use crate::error::{ServerError, ServerResult};
use sitepack::upload::{StorageLabels, UploadInfo};

/// Size of one read from the source.
const BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Name of the file written by [`StorageBackend::test`].
const TEST_FILE_NAME: &str = "sitepack-storage-test.txt";

#[derive(Debug)]
pub struct LocalBackend {
    identity: StorageIdentity,
    config: LocalStorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// The directory to store all files under.
    path: PathBuf,
}

impl LocalBackend {
    pub fn new(identity: StorageIdentity, config: LocalStorageConfig) -> Self {
        Self { identity, config }
    }

    fn folder(&self) -> PathBuf {
        self.config.path.join(self.identity.folder.trim_matches('/'))
    }

    fn get_path(&self, name: &str) -> PathBuf {
        self.folder().join(name)
    }

    /// Compares the size of a finished copy with the local size.
    ///
    /// A copy of the wrong size is removed.
    pub(super) async fn verify_copy(&self, dest: &Path, size: u64) -> ServerResult<ChunkOutcome> {
        let remote_size = fs::metadata(dest)
            .await
            .map_err(ServerError::storage_error)?
            .len();

        if remote_size != size {
            tracing::error!(remote_size, size, "Copied file has the wrong size");
            if let Err(e) = fs::remove_file(dest).await {
                tracing::warn!("Failed to remove {:?}: {}", dest, e);
            }

            return Ok(ChunkOutcome::fatal(format!(
                "Size mismatch: copied {} bytes of {}",
                remote_size, size
            )));
        }

        Ok(ChunkOutcome::completed(size))
    }
}

impl StorageLabels for LocalBackend {
    fn name(&self) -> &str {
        &self.identity.name
    }

    fn succeeded_text(&self) -> String {
        format!("Copied package to {} ({:?})", self.identity.name, self.folder())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn identity(&self) -> &StorageIdentity {
        &self.identity
    }

    async fn open(&self) -> ServerResult<()> {
        fs::create_dir_all(self.folder())
            .await
            .map_err(ServerError::storage_error)?;

        Ok(())
    }

    async fn upload_chunk(&self, req: ChunkRequest<'_>) -> ServerResult<ChunkOutcome> {
        let started = Instant::now();
        let offset = req.upload.offset;
        let dest = self.get_path(req.name);

        let (mut source, size) = match open_source(req.source, offset).await {
            Ok(source) => source,
            Err(outcome) => return Ok(outcome),
        };

        if offset == 0 {
            match fs::remove_file(&dest).await {
                Ok(()) => tracing::debug!("Removed stale {:?}", dest),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(ServerError::storage_error(e)),
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&dest)
            .await
            .map_err(ServerError::storage_error)?;

        // anything past the offset is from an interrupted chunk
        file.set_len(offset)
            .await
            .map_err(ServerError::storage_error)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(ServerError::storage_error)?;

        let mut position = offset;
        let mut eof = false;

        loop {
            let buf = BytesMut::with_capacity(BUFFER_SIZE);
            let chunk = match read_chunk_async(&mut source, buf).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    return Ok(ChunkOutcome::failed(
                        offset,
                        format!("Cannot read {:?}: {}", req.source, e),
                    ))
                }
            };

            if !chunk.is_empty() {
                if let Err(e) = file.write_all(&chunk).await {
                    return Ok(ChunkOutcome::failed(
                        offset,
                        format!("Cannot write {:?}: {}", dest, e),
                    ));
                }
                position += chunk.len() as u64;
            }

            if chunk.len() < BUFFER_SIZE {
                eof = true;
                break;
            }

            if started.elapsed() >= req.limits.max_time {
                break;
            }

            if !req.limits.load_delay.is_zero() {
                time::sleep(req.limits.load_delay).await;
            }
        }

        file.flush().await.map_err(ServerError::storage_error)?;
        drop(file);

        if let Err(outcome) = ensure_settled(&mut source, &req.limits, position).await {
            return Ok(outcome);
        }

        if !eof {
            tracing::debug!(position, size, "Chunk time budget used up");
            return Ok(ChunkOutcome::partial(position));
        }

        self.verify_copy(&dest, size).await
    }

    async fn abort(&self, name: &str, _upload: &UploadInfo) -> ServerResult<()> {
        let path = self.get_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!("Removed partial copy {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    async fn delete_file(&self, name: &str) -> ServerResult<()> {
        fs::remove_file(self.get_path(name))
            .await
            .map_err(ServerError::storage_error)?;

        Ok(())
    }

    async fn list_files(&self) -> ServerResult<Vec<String>> {
        let mut entries = match fs::read_dir(self.folder()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ServerError::storage_error(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(ServerError::storage_error)?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);

            if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    async fn download_file(&self, name: &str) -> ServerResult<Download> {
        let file = File::open(self.get_path(name))
            .await
            .map_err(ServerError::storage_error)?;

        Ok(Download::Stream(Box::new(file)))
    }

    async fn test(&self) -> ServerResult<()> {
        self.open().await?;

        let path = self.get_path(TEST_FILE_NAME);
        let contents = format!("sitepack storage test {}", chrono::Utc::now().to_rfc3339());
        fs::write(&path, contents.as_bytes())
            .await
            .map_err(ServerError::storage_error)?;

        let Download::Stream(mut stream) = self.download_file(TEST_FILE_NAME).await?;
        let mut read_back = String::new();
        stream
            .read_to_string(&mut read_back)
            .await
            .map_err(ServerError::storage_error)?;

        self.delete_file(TEST_FILE_NAME).await?;

        if read_back != contents {
            return Err(ServerError::StorageError(anyhow::anyhow!(
                "Test file came back different"
            )));
        }

        Ok(())
    }
}
