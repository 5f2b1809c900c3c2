//! Transfer of finished packages to their storages.
//!
//! A pass moves one bounded chunk per live upload and persists the
//! package, so the daemon can be stopped at any point and resume where
//! the records say.

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::time;
use tracing::instrument;

use super::{State, StateInner};
use crate::config::Config;
use crate::error::ServerError;
use crate::storage::{ChunkLimits, ChunkRequest, StorageBackend, StorageRegistry};
use sitepack::package::Package;
use sitepack::settings::GlobalSettings;
use sitepack::status::PackageStatus;
use sitepack::upload::UploadInfo;

/// Local files of a package, with their names in the storages.
#[derive(Debug)]
struct PackageFiles {
    installer: Option<(PathBuf, String)>,
    archive: Option<(PathBuf, String)>,
    archive_size: u64,
}

/// Runs transfer passes periodically.
pub async fn run_transfer_loop(config: Config) {
    let interval = config.transfer.interval;
    let state = StateInner::new(config).await;

    loop {
        // We don't stop even if it errors
        if let Err(e) = run_transfer_pass(&state).await {
            tracing::warn!("Transfer pass failed: {}", e);
        }

        if interval == Duration::ZERO {
            return;
        }

        time::sleep(interval).await;
    }
}

/// Runs one transfer pass.
#[instrument(skip_all)]
pub async fn run_transfer_once(config: Config) -> Result<()> {
    let state = StateInner::new(config).await;
    run_transfer_pass(&state).await
}

/// Runs one transfer pass on existing state.
#[instrument(skip_all)]
pub async fn run_transfer_pass(state: &State) -> Result<()> {
    let store = state.store();
    let pending = store.pending_cancel().await?;
    let storages = state.storages().await?;

    for id in store.list().await? {
        let mut package = match store.load(id).await {
            Ok(package) => package,
            Err(e) => {
                tracing::warn!(package_id = id, "Cannot load package: {}", e);
                continue;
            }
        };

        let cancel_requested = pending.contains(&id);
        if let Err(e) = process_package(state, storages, &mut package, cancel_requested).await {
            tracing::warn!(package_id = id, "Transfer failed: {}", e);
        }
    }

    Ok(())
}

#[instrument(skip_all, fields(package_id = package.id))]
async fn process_package(
    state: &StateInner,
    storages: &StorageRegistry,
    package: &mut Package,
    cancel_requested: bool,
) -> Result<()> {
    let store = state.store();
    let status = package.status();
    let files = PackageFiles::of(package);

    if cancel_requested {
        if !status.is_error() && !status.is_complete() {
            cancel_package(storages, &files, package).await?;
            save_package(state, package).await?;
        }

        store.clear_cancel(package.id).await?;
        return Ok(());
    }

    if !status.is_transferring() {
        return Ok(());
    }

    if status < PackageStatus::STORAGE_PROCESSING {
        package.set_status(PackageStatus::STORAGE_PROCESSING)?;
    }

    let settings = &state.config().settings;
    let limits = ChunkLimits::from_config(&state.config().transfer);

    for storage_id in package.storage_ids() {
        let upload = match package.latest_upload_mut(storage_id) {
            Some(upload) => upload,
            None => continue,
        };

        if !upload.has_completed() {
            transfer_step(storages, &files, upload, settings, limits).await;
        }

        upload.mark_terminal();
    }

    match package.transfer_outcome() {
        Some(outcome) if outcome.is_complete() => {
            tracing::info!("Package transferred to all storages");
            package.set_status(outcome)?;
        }
        Some(outcome) => {
            tracing::warn!(status = %outcome, "Package transfer did not succeed");
            package.fail(outcome)?;
        }
        None => {
            let progress = PackageStatus::transfer_progress(package.transfer_percent());
            if progress > package.status() {
                package.set_status(progress)?;
            }
        }
    }

    save_package(state, package).await
}

/// Writes back a package unless it was deleted in the meantime.
async fn save_package(state: &StateInner, package: &Package) -> Result<()> {
    match state.store().save_existing(package).await {
        Err(ServerError::NoSuchPackage) => {
            tracing::info!("Package was deleted during the pass, dropping its progress");
            Ok(())
        }
        r => r.map_err(Into::into),
    }
}

/// Stops a package in whatever stage it is.
async fn cancel_package(
    storages: &StorageRegistry,
    files: &PackageFiles,
    package: &mut Package,
) -> Result<()> {
    if package.status().is_pending() || package.is_building() {
        tracing::info!("Cancelling build");
        package.fail(PackageStatus::BUILD_CANCELLED)?;
        return Ok(());
    }

    tracing::info!("Cancelling transfer");
    for storage_id in package.storage_ids() {
        if let Some(upload) = package.latest_upload_mut(storage_id) {
            if !upload.has_completed() {
                if upload.has_started {
                    if let Some(backend) = storages.get(storage_id) {
                        discard_partial(backend.as_ref(), files, upload).await;
                    }
                }
                upload.cancel();
            }
            upload.mark_terminal();
        }
    }

    package.fail(PackageStatus::STORAGE_CANCELLED)?;
    Ok(())
}

/// Releases what an upload that stopped for good left in its storage.
///
/// The resume point is kept if the storage refuses, so the leftover can
/// still be found from the record.
async fn discard_partial(
    backend: &dyn StorageBackend,
    files: &PackageFiles,
    upload: &mut UploadInfo,
) {
    let name = match files.in_flight(upload) {
        Some(name) => name,
        None => return,
    };

    match backend.abort(name, upload).await {
        Ok(()) => upload.reset_transfer(),
        Err(e) => tracing::warn!(name, "Cannot discard partial copy: {}", e),
    }
}

/// Moves one chunk to one storage.
///
/// Nothing that happens here leaves this upload record.
#[instrument(skip_all, fields(storage_id = upload.storage_id))]
async fn transfer_step(
    storages: &StorageRegistry,
    files: &PackageFiles,
    upload: &mut UploadInfo,
    settings: &GlobalSettings,
    limits: ChunkLimits,
) {
    upload.start();

    let backend = match storages.get(upload.storage_id) {
        Some(backend) => backend.clone(),
        None => {
            tracing::error!("Unknown storage id");
            upload.increase_failure_count(settings);
            return;
        }
    };

    if let Err(e) = backend.open().await {
        tracing::warn!("Cannot open storage: {}", e);
        upload.status_message_details = e.to_string();
        if upload.increase_failure_count(settings) {
            discard_partial(backend.as_ref(), files, upload).await;
        }
        return;
    }

    let installer = !upload.copied_installer;
    let (file, what) = if installer {
        (&files.installer, "installer")
    } else {
        (&files.archive, "archive")
    };

    let (source, name) = match file {
        Some((source, name)) => (source, name),
        None => {
            let e = ServerError::MissingPackageFile { what };
            tracing::error!("{}", e);
            upload.fail_fatally(e.to_string());
            return;
        }
    };

    let outcome = backend
        .upload_chunk(ChunkRequest {
            source,
            name,
            limits,
            upload: &mut *upload,
        })
        .await;

    match outcome {
        Err(e) => {
            tracing::warn!(what, "Chunk failed: {}", e);
            upload.status_message_details = e.to_string();
            if upload.increase_failure_count(settings) {
                discard_partial(backend.as_ref(), files, upload).await;
            }
        }
        Ok(outcome) if outcome.fatal_error => {
            let details = outcome
                .error_details
                .unwrap_or_else(|| format!("Cannot copy the {}", what));
            tracing::error!(what, "Upload failed fatally: {}", details);

            if let Err(e) = backend.delete_file(name).await {
                tracing::debug!("Nothing removed from storage: {}", e);
            }

            upload.fail_fatally(details);
        }
        Ok(outcome) if !outcome.success => {
            let details = outcome.error_details.unwrap_or_default();
            tracing::warn!(what, offset = outcome.next_offset, "Chunk failed: {}", details);

            upload.offset = outcome.next_offset;
            upload.status_message_details = details;
            if upload.increase_failure_count(settings) {
                discard_partial(backend.as_ref(), files, upload).await;
            }
        }
        Ok(outcome) if outcome.completed => {
            tracing::info!(what, size = outcome.next_offset, "File copied");

            if installer {
                upload.copied_installer = true;
            } else {
                upload.copied_archive = true;
                upload.set_progress(100.0);
            }

            upload.reset_transfer();
            upload.status_message_details.clear();
        }
        Ok(outcome) => {
            tracing::debug!(what, offset = outcome.next_offset, "Chunk copied");

            upload.offset = outcome.next_offset;
            if !installer && files.archive_size > 0 {
                upload.set_progress(outcome.next_offset as f32 * 100.0 / files.archive_size as f32);
            }
        }
    }
}

impl PackageFiles {
    fn of(package: &Package) -> Self {
        Self {
            installer: package
                .archive
                .installer_path
                .clone()
                .map(|path| (path, package.installer_file_name())),
            archive: package
                .archive
                .path
                .clone()
                .map(|path| (path, package.archive_file_name())),
            archive_size: package.archive.size,
        }
    }

    /// Name in the storage of the file an upload is copying.
    fn in_flight(&self, upload: &UploadInfo) -> Option<&str> {
        let file = if !upload.copied_installer {
            &self.installer
        } else if !upload.copied_archive {
            &self.archive
        } else {
            return None;
        };

        file.as_ref().map(|(_, name)| name.as_str())
    }
}
