use super::*;

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use tempfile::TempDir;

use crate::config::load_config_from_str;
use crate::error::ServerResult;
use crate::storage::{
    ChunkOutcome, Download, LocalBackend, LocalStorageConfig, StorageBackend, StorageIdentity,
};
use sitepack::upload::{StorageLabels, UploadStatus};

/// A storage that can't be reached.
#[derive(Debug)]
struct UnreachableBackend {
    identity: StorageIdentity,
}

impl StorageLabels for UnreachableBackend {
    fn name(&self) -> &str {
        &self.identity.name
    }
}

fn unreachable() -> ServerError {
    ServerError::StorageError(anyhow!("connection refused"))
}

#[async_trait]
impl StorageBackend for UnreachableBackend {
    fn identity(&self) -> &StorageIdentity {
        &self.identity
    }

    async fn open(&self) -> ServerResult<()> {
        Err(unreachable())
    }

    async fn upload_chunk(&self, _req: ChunkRequest<'_>) -> ServerResult<ChunkOutcome> {
        Err(unreachable())
    }

    async fn abort(&self, _name: &str, _upload: &UploadInfo) -> ServerResult<()> {
        Err(unreachable())
    }

    async fn delete_file(&self, _name: &str) -> ServerResult<()> {
        Err(unreachable())
    }

    async fn list_files(&self) -> ServerResult<Vec<String>> {
        Err(unreachable())
    }

    async fn download_file(&self, _name: &str) -> ServerResult<Download> {
        Err(unreachable())
    }

    async fn test(&self) -> ServerResult<()> {
        Err(unreachable())
    }
}

/// A storage that starts uploads but never finishes a chunk.
#[derive(Debug)]
struct StalledBackend {
    identity: StorageIdentity,

    /// Name and continuation of every aborted upload.
    aborted: Mutex<Vec<(String, Option<String>)>>,
}

impl StorageLabels for StalledBackend {
    fn name(&self) -> &str {
        &self.identity.name
    }
}

#[async_trait]
impl StorageBackend for StalledBackend {
    fn identity(&self) -> &StorageIdentity {
        &self.identity
    }

    async fn open(&self) -> ServerResult<()> {
        Ok(())
    }

    async fn upload_chunk(&self, req: ChunkRequest<'_>) -> ServerResult<ChunkOutcome> {
        if req.upload.data.is_none() {
            req.upload.data = Some("upload-7".to_string());
        }

        Ok(ChunkOutcome::failed(req.upload.offset, "timed out"))
    }

    async fn abort(&self, name: &str, upload: &UploadInfo) -> ServerResult<()> {
        self.aborted
            .lock()
            .unwrap()
            .push((name.to_string(), upload.data.clone()));
        Ok(())
    }

    async fn delete_file(&self, _name: &str) -> ServerResult<()> {
        Ok(())
    }

    async fn list_files(&self) -> ServerResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn download_file(&self, _name: &str) -> ServerResult<Download> {
        Err(unreachable())
    }

    async fn test(&self) -> ServerResult<()> {
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    state: State,
}

impl Fixture {
    fn new(max_retries: u32) -> Self {
        Self::build(max_retries, "1m", Vec::new())
    }

    fn build(
        max_retries: u32,
        max_chunk_time: &str,
        extra_storages: Vec<Arc<dyn StorageBackend>>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let config = load_config_from_str(&format!(
            r#"
store-path = {:?}
temp-path = {:?}

[settings]
max-storage-retries = {}

[transfer]
max-chunk-time = {:?}
settle-delay = "0s"
settle-attempts = 1
interval = "0s"
"#,
            dir.path().join("packages").to_string_lossy(),
            dir.path().join("tmp").to_string_lossy(),
            max_retries,
            max_chunk_time,
        ))
        .unwrap();

        let mut storages = StorageRegistry::default();

        let local_config: LocalStorageConfig = toml::from_str(&format!(
            "path = {:?}",
            dir.path().join("storage").to_string_lossy()
        ))
        .unwrap();
        storages
            .insert(Arc::new(LocalBackend::new(
                StorageIdentity {
                    id: 1,
                    name: "Local".to_string(),
                    folder: "backups".to_string(),
                },
                local_config,
            )))
            .unwrap();

        storages
            .insert(Arc::new(UnreachableBackend {
                identity: StorageIdentity {
                    id: 2,
                    name: "Offsite".to_string(),
                    folder: String::new(),
                },
            }))
            .unwrap();

        for backend in extra_storages {
            storages.insert(backend).unwrap();
        }

        Self {
            state: StateInner::with_storages(config, storages),
            dir,
        }
    }

    fn storage_path(&self) -> PathBuf {
        self.dir.path().join("storage").join("backups")
    }

    /// Creates a built package with its files on disk.
    async fn built_package(&self, id: i64, storages: &[i64]) -> Package {
        self.built_package_sized(id, storages, 300_000).await
    }

    async fn built_package_sized(&self, id: i64, storages: &[i64], archive_len: u32) -> Package {
        let mut builder = Package::builder(id, "site").hash(format!("{:020}_20240102030405", id));
        for storage_id in storages {
            builder = builder.storage(*storage_id);
        }
        let mut package = builder.build();

        let build_dir = self.dir.path().join("build");
        std::fs::create_dir_all(&build_dir).unwrap();

        let archive_path = build_dir.join(package.archive_file_name());
        let archive: Vec<u8> = (0..archive_len).map(|i| (i % 7) as u8).collect();
        std::fs::write(&archive_path, &archive).unwrap();

        let installer_path = build_dir.join(package.installer_file_name());
        std::fs::write(&installer_path, b"<?php // installer").unwrap();

        package.archive.path = Some(archive_path);
        package.archive.installer_path = Some(installer_path);
        package.archive.size = archive.len() as u64;
        package.set_status(PackageStatus::COPIED_PACKAGE).unwrap();

        self.state.store().save(&package).await.unwrap();
        package
    }

    async fn pass(&self) {
        run_transfer_pass(&self.state).await.unwrap();
    }

    async fn load(&self, id: i64) -> Package {
        self.state.store().load(id).await.unwrap()
    }
}

#[tokio::test]
async fn test_failure_isolation() {
    let fixture = Fixture::new(1);
    let package = fixture.built_package(1, &[1, 2]).await;

    fixture.pass().await;
    let after_first = fixture.load(1).await;
    assert_eq!(PackageStatus::STORAGE_PROCESSING, after_first.status());

    let local = after_first.latest_upload(1).unwrap();
    assert!(local.copied_installer);
    assert!(!local.copied_archive);
    assert_eq!(0, local.failure_count);

    let offsite = after_first.latest_upload(2).unwrap();
    assert_eq!(1, offsite.failure_count);
    assert!(!offsite.failed);

    fixture.pass().await;
    let done = fixture.load(1).await;

    let local = done.latest_upload(1).unwrap();
    assert_eq!(UploadStatus::Succeeded, local.status());
    assert_eq!(0, local.failure_count);
    assert_eq!(100.0, local.progress);
    assert!(local.stopped_at.is_some());

    let offsite = done.latest_upload(2).unwrap();
    assert_eq!(UploadStatus::Failed, offsite.status());
    assert!(offsite.stopped_at.is_some());

    let storages = fixture.state.storages().await.unwrap();
    assert_eq!(
        "Failed to copy to Offsite (Storage error: connection refused)",
        offsite.status_message(storages)
    );

    // one storage succeeded
    assert_eq!(PackageStatus::COMPLETE, done.status());

    assert!(fixture.storage_path().join(package.archive_file_name()).exists());
    assert!(fixture.storage_path().join(package.installer_file_name()).exists());

    // nothing left to do
    fixture.pass().await;
    assert_eq!(done, fixture.load(1).await);
}

#[tokio::test]
async fn test_all_storages_failed() {
    let fixture = Fixture::new(0);
    fixture.built_package(1, &[2]).await;

    fixture.pass().await;
    let package = fixture.load(1).await;

    assert!(package.latest_upload(2).unwrap().failed);
    assert_eq!(PackageStatus::STORAGE_FAILED, package.status());
}

#[tokio::test]
async fn test_unknown_storage() {
    let fixture = Fixture::new(0);
    fixture.built_package(1, &[1, 9]).await;

    fixture.pass().await;
    let package = fixture.load(1).await;

    let unknown = package.latest_upload(9).unwrap();
    assert!(unknown.failed);

    let storages = fixture.state.storages().await.unwrap();
    assert_eq!(
        "Error. Unknown storage id 9",
        unknown.status_message(storages)
    );

    // the other storage keeps going
    let local = package.latest_upload(1).unwrap();
    assert!(local.copied_installer);
    assert!(package.status().is_transferring());
}

#[tokio::test]
async fn test_cancel_transfer() {
    let fixture = Fixture::new(5);
    fixture.built_package(1, &[1, 2]).await;

    fixture.pass().await;
    fixture.state.store().request_cancel(1).await.unwrap();

    let pending = fixture.state.store().pending_cancel().await.unwrap();
    assert_eq!(
        PackageStatus::PENDING_CANCEL,
        fixture.load(1).await.display_status(&pending)
    );

    fixture.pass().await;
    let package = fixture.load(1).await;

    assert_eq!(PackageStatus::STORAGE_CANCELLED, package.status());
    for upload in package.latest_uploads() {
        assert_eq!(UploadStatus::Cancelled, upload.status());
        assert!(upload.stopped_at.is_some());
    }

    let pending = fixture.state.store().pending_cancel().await.unwrap();
    assert!(pending.is_empty());
    assert_eq!(PackageStatus::STORAGE_CANCELLED, package.display_status(&pending));
}

#[tokio::test]
async fn test_cancel_build() {
    let fixture = Fixture::new(5);
    let mut package = Package::builder(4, "site").storage(1).build();
    package.set_status(PackageStatus::ARC_START).unwrap();
    fixture.state.store().save(&package).await.unwrap();

    fixture.state.store().request_cancel(4).await.unwrap();
    fixture.pass().await;

    assert_eq!(PackageStatus::BUILD_CANCELLED, fixture.load(4).await.status());
}

#[tokio::test]
async fn test_building_package_untouched() {
    let fixture = Fixture::new(5);
    let mut package = Package::builder(3, "site").storage(1).build();
    package.set_status(PackageStatus::DB_DONE).unwrap();
    fixture.state.store().save(&package).await.unwrap();

    fixture.pass().await;
    assert_eq!(package, fixture.load(3).await);
}

#[tokio::test]
async fn test_missing_archive_is_fatal() {
    let fixture = Fixture::new(5);
    let mut package = fixture.built_package(1, &[1]).await;
    package.archive.path = None;
    fixture.state.store().save(&package).await.unwrap();

    // installer first, then the archive is found missing
    fixture.pass().await;
    fixture.pass().await;

    let package = fixture.load(1).await;
    let upload = package.latest_upload(1).unwrap();
    assert!(upload.failed);
    assert!(upload
        .status_message_details
        .contains("no local archive"));
    assert_eq!(PackageStatus::STORAGE_FAILED, package.status());
}

#[tokio::test]
async fn test_giving_up_discards_partial_upload() {
    let stalled = Arc::new(StalledBackend {
        identity: StorageIdentity {
            id: 3,
            name: "Flaky".to_string(),
            folder: String::new(),
        },
        aborted: Mutex::new(Vec::new()),
    });
    let fixture = Fixture::build(1, "1m", vec![stalled.clone() as Arc<dyn StorageBackend>]);
    let package = fixture.built_package(1, &[3]).await;

    fixture.pass().await;
    let upload = fixture.load(1).await.latest_upload(3).unwrap().clone();
    assert_eq!(1, upload.failure_count);
    assert_eq!(Some("upload-7".to_string()), upload.data);
    assert!(stalled.aborted.lock().unwrap().is_empty());

    fixture.pass().await;
    let done = fixture.load(1).await;
    let upload = done.latest_upload(3).unwrap();
    assert!(upload.failed);
    assert_eq!(None, upload.data);

    assert_eq!(
        vec![(package.installer_file_name(), Some("upload-7".to_string()))],
        *stalled.aborted.lock().unwrap()
    );
    assert_eq!(PackageStatus::STORAGE_FAILED, done.status());

    // a failed upload is not aborted again
    fixture.pass().await;
    assert_eq!(1, stalled.aborted.lock().unwrap().len());
}

#[tokio::test]
async fn test_cancel_discards_partial_copy() {
    let fixture = Fixture::build(5, "0s", Vec::new());
    let package = fixture
        .built_package_sized(1, &[1], 2 * 2 * 1024 * 1024 + 1234)
        .await;

    // the installer, then the first buffer of the archive
    fixture.pass().await;
    fixture.pass().await;

    let archive = fixture.storage_path().join(package.archive_file_name());
    let installer = fixture.storage_path().join(package.installer_file_name());
    assert!(archive.exists());
    assert!(fixture.load(1).await.latest_upload(1).unwrap().offset > 0);

    fixture.state.store().request_cancel(1).await.unwrap();
    fixture.pass().await;

    let cancelled = fixture.load(1).await;
    assert_eq!(PackageStatus::STORAGE_CANCELLED, cancelled.status());

    let upload = cancelled.latest_upload(1).unwrap();
    assert_eq!(UploadStatus::Cancelled, upload.status());
    assert_eq!(0, upload.offset);

    assert!(!archive.exists());
    assert!(installer.exists());
}

#[tokio::test]
async fn test_cancel_pending_package() {
    let fixture = Fixture::new(5);
    let package = Package::builder(6, "site").storage(1).build();
    fixture.state.store().save(&package).await.unwrap();

    fixture.state.store().request_cancel(6).await.unwrap();
    fixture.pass().await;

    assert_eq!(PackageStatus::BUILD_CANCELLED, fixture.load(6).await.status());
}

#[tokio::test]
async fn test_deleted_package_not_written_back() {
    let fixture = Fixture::new(5);
    let mut package = fixture.built_package(1, &[1]).await;
    let store = fixture.state.store();

    store.delete(1).await.unwrap();

    let storages = fixture.state.storages().await.unwrap();
    process_package(&fixture.state, storages, &mut package, false)
        .await
        .unwrap();

    assert!(store.list().await.unwrap().is_empty());
    assert!(package.latest_upload(1).unwrap().copied_installer);
}
