//! S3 storage.
//!
//! Files of at least one part are sent as a multipart upload that spans
//! as many chunks as needed. The upload ID is kept in `data`, the
//! finished parts in `data2` and the next part number in
//! `chunk_position`.

use std::time::Instant;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    config::{Credentials, Region},
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::BytesMut;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::time;

use super::{
    ensure_settled, open_source, read_chunk_async, ChunkOutcome, ChunkRequest, Download,
    StorageBackend, StorageIdentity,
};
use crate::error::{ServerError, ServerResult};
use sitepack::upload::{StorageLabels, UploadInfo};

/// The chunk size for each part in a multipart upload.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Name of the object written by [`StorageBackend::test`].
const TEST_FILE_NAME: &str = "sitepack-storage-test.txt";

/// The S3 remote file storage backend.
#[derive(Debug)]
pub struct S3Backend {
    identity: StorageIdentity,
    client: Client,
    config: S3StorageConfig,
}

/// S3 remote file storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// The AWS region.
    region: String,

    /// The name of the bucket.
    bucket: String,

    /// Custom S3 endpoint.
    ///
    /// Set this if you are using an S3-compatible object storage (e.g., Minio).
    endpoint: Option<String>,

    /// S3 credentials.
    ///
    /// If not specified, it's read from the `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY` environment variables.
    credentials: Option<S3CredentialsConfig>,
}

/// S3 credential configuration.
#[derive(Derivative, Clone, Deserialize)]
#[derivative(Debug)]
pub struct S3CredentialsConfig {
    /// Access key ID.
    access_key_id: String,

    /// Secret access key.
    #[derivative(Debug = "ignore")]
    secret_access_key: String,
}

/// A finished part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PartRecord {
    part_number: i32,
    e_tag: Option<String>,
}

/// Progress of a multipart upload, as kept in the upload record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MultipartProgress {
    upload_id: String,

    /// Finished parts, numbered from 1 without gaps.
    parts: Vec<PartRecord>,
}

impl MultipartProgress {
    fn new(upload_id: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            parts: Vec::new(),
        }
    }

    /// Reads the progress kept in `upload`.
    ///
    /// Returns `Ok(None)` if no multipart upload was started.
    fn load(upload: &UploadInfo) -> Result<Option<Self>, String> {
        let upload_id = match &upload.data {
            Some(upload_id) => upload_id.clone(),
            None => return Ok(None),
        };

        let parts: Vec<PartRecord> = match &upload.data2 {
            Some(data2) => {
                serde_json::from_str(data2).map_err(|e| format!("Corrupt part list: {}", e))?
            }
            None => Vec::new(),
        };

        for (index, part) in parts.iter().enumerate() {
            if i64::from(part.part_number) != index as i64 + 1 {
                return Err(format!(
                    "Corrupt part list: part {} recorded in place of part {}",
                    part.part_number,
                    index + 1
                ));
            }
        }

        let progress = Self { upload_id, parts };

        if let Some(next_part) = upload.chunk_position {
            if next_part != i64::from(progress.next_part()) {
                return Err(format!(
                    "Corrupt part list: next part is {} but {} parts are recorded",
                    next_part,
                    progress.parts.len()
                ));
            }
        }

        Ok(Some(progress))
    }

    /// Writes the progress into `upload`.
    fn store(&self, upload: &mut UploadInfo) -> ServerResult<()> {
        upload.data = Some(self.upload_id.clone());
        upload.data2 = Some(serde_json::to_string(&self.parts).map_err(ServerError::storage_error)?);
        upload.chunk_position = Some(i64::from(self.next_part()));

        Ok(())
    }

    fn next_part(&self) -> i32 {
        self.parts.len() as i32 + 1
    }

    fn record_part(&mut self, e_tag: Option<String>) {
        let part_number = self.next_part();
        self.parts.push(PartRecord { part_number, e_tag });
    }

    /// Returns whether the recorded parts end at `offset`.
    ///
    /// Every part but the last one is full.
    fn resumes_at(&self, offset: u64) -> bool {
        let full = CHUNK_SIZE as u64;

        match self.parts.len() as u64 {
            0 => offset == 0,
            count => offset > (count - 1) * full && offset <= count * full,
        }
    }

    fn completed_upload(&self) -> CompletedMultipartUpload {
        let completed_parts = self
            .parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .set_e_tag(part.e_tag.clone())
                    .part_number(part.part_number)
                    .build()
            })
            .collect::<Vec<_>>();

        CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build()
    }
}

impl S3Backend {
    pub async fn new(identity: StorageIdentity, config: S3StorageConfig) -> ServerResult<Self> {
        let s3_config = Self::config_builder(&config)
            .await?
            .region(Region::new(config.region.to_owned()))
            .build();

        Ok(Self {
            identity,
            client: Client::from_conf(s3_config),
            config,
        })
    }

    async fn config_builder(config: &S3StorageConfig) -> ServerResult<S3ConfigBuilder> {
        let shared_config = aws_config::load_from_env().await;
        let mut builder = S3ConfigBuilder::from(&shared_config);

        if let Some(credentials) = &config.credentials {
            builder = builder.credentials_provider(Credentials::new(
                &credentials.access_key_id,
                &credentials.secret_access_key,
                None,
                None,
                "s3",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(builder)
    }

    fn key(&self, name: &str) -> String {
        self.identity.path_in_folder(name)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> ServerResult<()> {
        tracing::warn!(key, upload_id, "Aborting multipart upload");

        self.client
            .abort_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(())
    }

    /// Gives up on the multipart upload recorded in `upload`, if any.
    async fn abort_upload(&self, key: &str, upload: &UploadInfo) {
        if let Some(upload_id) = &upload.data {
            if let Err(e) = self.abort_multipart(key, upload_id).await {
                tracing::warn!("Failed to abort multipart upload: {}", e);
            }
        }
    }

    /// Compares the size of the stored object with the local size.
    async fn verify_size(&self, key: &str, size: u64) -> ServerResult<ChunkOutcome> {
        let head = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        let remote_size = head.content_length().unwrap_or(-1);
        if remote_size != size as i64 {
            tracing::error!(remote_size, size, "Stored object has the wrong size");
            self.delete_file_by_key(key).await?;

            return Ok(ChunkOutcome::fatal(format!(
                "Size mismatch: stored {} bytes of {}",
                remote_size, size
            )));
        }

        Ok(ChunkOutcome::completed(size))
    }

    async fn delete_file_by_key(&self, key: &str) -> ServerResult<()> {
        let deletion = self
            .client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        tracing::debug!("delete_file -> {:#?}", deletion);

        Ok(())
    }
}

impl StorageLabels for S3Backend {
    fn name(&self) -> &str {
        &self.identity.name
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn identity(&self) -> &StorageIdentity {
        &self.identity
    }

    async fn open(&self) -> ServerResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(())
    }

    async fn upload_chunk(&self, req: ChunkRequest<'_>) -> ServerResult<ChunkOutcome> {
        let started = Instant::now();
        let key = self.key(req.name);
        let offset = req.upload.offset;

        let (mut source, size) = match open_source(req.source, offset).await {
            Ok(source) => source,
            Err(outcome) => {
                self.abort_upload(&key, req.upload).await;
                return Ok(outcome);
            }
        };

        if offset == 0 && req.upload.data.is_none() {
            self.delete_file_by_key(&key).await?;

            if size < CHUNK_SIZE as u64 {
                // do a normal PutObject
                let buf = BytesMut::with_capacity(CHUNK_SIZE);
                let body = match read_chunk_async(&mut source, buf).await {
                    Ok(body) => body,
                    Err(e) => return Ok(ChunkOutcome::failed(0, e.to_string())),
                };

                let put_object = self
                    .client
                    .put_object()
                    .bucket(&self.config.bucket)
                    .key(&key)
                    .body(body.into())
                    .send()
                    .await
                    .map_err(ServerError::storage_error)?;

                tracing::debug!("put_object -> {:#?}", put_object);

                if let Err(outcome) = ensure_settled(&mut source, &req.limits, size).await {
                    return Ok(outcome);
                }

                return self.verify_size(&key, size).await;
            }

            let multipart = self
                .client
                .create_multipart_upload()
                .bucket(&self.config.bucket)
                .key(&key)
                .send()
                .await
                .map_err(ServerError::storage_error)?;

            let upload_id = multipart.upload_id().ok_or_else(|| {
                ServerError::StorageError(anyhow::anyhow!("No upload ID was returned"))
            })?;

            tracing::info!(key = %key, upload_id, "Started multipart upload");

            MultipartProgress::new(upload_id).store(req.upload)?;
        }

        let mut progress = match MultipartProgress::load(req.upload) {
            Ok(Some(progress)) if progress.resumes_at(offset) => progress,
            Ok(Some(progress)) => {
                self.abort_upload(&key, req.upload).await;
                return Ok(ChunkOutcome::fatal(format!(
                    "Offset {} does not follow the {} recorded parts",
                    offset,
                    progress.parts.len()
                )));
            }
            Ok(None) => {
                return Ok(ChunkOutcome::fatal(format!(
                    "No multipart upload to resume at offset {}",
                    offset
                )))
            }
            Err(details) => {
                self.abort_upload(&key, req.upload).await;
                return Ok(ChunkOutcome::fatal(details));
            }
        };

        let mut position = offset;
        let mut eof = false;

        loop {
            let buf = BytesMut::with_capacity(CHUNK_SIZE);
            let chunk = match read_chunk_async(&mut source, buf).await {
                Ok(chunk) => chunk,
                Err(e) => return Ok(ChunkOutcome::failed(position, e.to_string())),
            };

            if !chunk.is_empty() {
                let len = chunk.len() as u64;
                let part_number = progress.next_part();
                let part = self
                    .client
                    .upload_part()
                    .bucket(&self.config.bucket)
                    .key(&key)
                    .upload_id(&progress.upload_id)
                    .part_number(part_number)
                    .body(chunk.clone().into())
                    .send()
                    .await;

                let part = match part {
                    Ok(part) => part,
                    Err(e) => {
                        return Ok(ChunkOutcome::failed(
                            position,
                            format!("Part {} failed: {}", part_number, e),
                        ))
                    }
                };

                progress.record_part(part.e_tag().map(str::to_string));
                progress.store(req.upload)?;
                position += len;
            }

            if chunk.len() < CHUNK_SIZE {
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

        if let Err(outcome) = ensure_settled(&mut source, &req.limits, position).await {
            self.abort_upload(&key, req.upload).await;
            return Ok(outcome);
        }

        if !eof {
            tracing::debug!(
                position,
                size,
                next_part = progress.next_part(),
                "Chunk time budget used up"
            );
            return Ok(ChunkOutcome::partial(position));
        }

        let completion = self
            .client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(&key)
            .upload_id(&progress.upload_id)
            .multipart_upload(progress.completed_upload())
            .send()
            .await;

        match completion {
            Ok(completion) => tracing::debug!("complete_multipart_upload -> {:#?}", completion),
            Err(e) => {
                return Ok(ChunkOutcome::failed(
                    position,
                    format!("Cannot complete upload: {}", e),
                ))
            }
        }

        self.verify_size(&key, size).await
    }

    async fn abort(&self, name: &str, upload: &UploadInfo) -> ServerResult<()> {
        match &upload.data {
            Some(upload_id) => self.abort_multipart(&self.key(name), upload_id).await,
            None => Ok(()),
        }
    }

    async fn delete_file(&self, name: &str) -> ServerResult<()> {
        self.delete_file_by_key(&self.key(name)).await
    }

    async fn list_files(&self) -> ServerResult<Vec<String>> {
        let prefix = self.key("");
        let mut names = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let listing = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(ServerError::storage_error)?;

            for object in listing.contents() {
                if let Some(name) = object.key().and_then(|k| k.strip_prefix(&prefix)) {
                    if !name.is_empty() && !name.contains('/') {
                        names.push(name.to_string());
                    }
                }
            }

            match listing.next_continuation_token() {
                Some(token) if listing.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    async fn download_file(&self, name: &str) -> ServerResult<Download> {
        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(self.key(name))
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(Download::Stream(Box::new(Box::pin(
            output.body.into_async_read(),
        ))))
    }

    async fn test(&self) -> ServerResult<()> {
        self.open().await?;

        let key = self.key(TEST_FILE_NAME);
        let contents = format!("sitepack storage test {}", chrono::Utc::now().to_rfc3339());

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(contents.clone().into_bytes().into())
            .send()
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
                "Test object came back different"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: u64 = CHUNK_SIZE as u64;

    #[test]
    fn test_multipart_resume() {
        let mut upload = UploadInfo::new(3);
        assert_eq!(Ok(None), MultipartProgress::load(&upload));

        MultipartProgress::new("upload-1").store(&mut upload).unwrap();
        assert_eq!(Some("upload-1".to_string()), upload.data);
        assert_eq!(Some("[]".to_string()), upload.data2);
        assert_eq!(Some(1), upload.chunk_position);

        let mut progress = MultipartProgress::load(&upload).unwrap().unwrap();
        assert!(progress.resumes_at(0));
        assert_eq!(1, progress.next_part());

        // first chunk: one full part, then the time budget ran out
        progress.record_part(Some("\"e1\"".to_string()));
        progress.store(&mut upload).unwrap();
        upload.offset = FULL;

        let mut progress = MultipartProgress::load(&upload).unwrap().unwrap();
        assert_eq!(Some(2), upload.chunk_position);
        assert_eq!(2, progress.next_part());
        assert!(progress.resumes_at(FULL));
        assert!(!progress.resumes_at(0));
        assert!(!progress.resumes_at(2 * FULL));

        // the short last part, then completion failed and is retried
        progress.record_part(Some("\"e2\"".to_string()));
        progress.store(&mut upload).unwrap();

        let progress = MultipartProgress::load(&upload).unwrap().unwrap();
        assert!(progress.resumes_at(FULL + 1234));
        assert!(progress.resumes_at(2 * FULL));
        assert!(!progress.resumes_at(FULL));
        assert_eq!(
            vec![1, 2],
            progress
                .parts
                .iter()
                .map(|part| part.part_number)
                .collect::<Vec<_>>()
        );
        assert_eq!(Some("\"e2\""), progress.parts[1].e_tag.as_deref());
    }

    #[test]
    fn test_part_list_format() {
        let mut upload = UploadInfo::new(3);
        let mut progress = MultipartProgress::new("upload-1");
        progress.record_part(Some("etag".to_string()));
        progress.record_part(None);
        progress.store(&mut upload).unwrap();

        assert_eq!(
            Some(r#"[{"part_number":1,"e_tag":"etag"},{"part_number":2,"e_tag":null}]"#),
            upload.data2.as_deref()
        );
        assert_eq!(Some(3), upload.chunk_position);

        // records written before the cursor was kept still load
        upload.chunk_position = None;
        assert_eq!(
            Some(progress),
            MultipartProgress::load(&upload).unwrap()
        );
    }

    #[test]
    fn test_corrupt_part_list() {
        let mut upload = UploadInfo::new(3);
        upload.data = Some("upload-1".to_string());

        upload.data2 = Some("not json".to_string());
        let err = MultipartProgress::load(&upload).unwrap_err();
        assert!(err.starts_with("Corrupt part list"), "{}", err);

        // a part went missing
        upload.data2 = Some(r#"[{"part_number":2,"e_tag":null}]"#.to_string());
        MultipartProgress::load(&upload).unwrap_err();

        // cursor and list disagree
        upload.data2 = Some(r#"[{"part_number":1,"e_tag":null}]"#.to_string());
        upload.chunk_position = Some(5);
        MultipartProgress::load(&upload).unwrap_err();

        upload.chunk_position = Some(2);
        let progress = MultipartProgress::load(&upload).unwrap().unwrap();
        assert_eq!(2, progress.next_part());
    }
}
