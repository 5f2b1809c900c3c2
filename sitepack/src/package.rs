//! Packages.
//!
//! A package is one backup unit: an archive of site files, optionally a
//! database dump, and an installer. It is created when a build is
//! requested, advanced by the build pipeline and the transfer daemon, and
//! only removed by an explicit delete.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use wildmatch::WildMatch;

use crate::error::{PackError, PackResult};
use crate::filter::ComponentSet;
use crate::status::PackageStatus;
use crate::upload::UploadInfo;

/// Source of pending cancellation requests.
///
/// Cancellation is cooperative: the request is recorded outside the
/// package and honored by whoever observes it next.
pub trait CancelRequests {
    fn is_pending_cancel(&self, package_id: i64) -> bool;
}

impl CancelRequests for HashSet<i64> {
    fn is_pending_cancel(&self, package_id: i64) -> bool {
        self.contains(&package_id)
    }
}

impl CancelRequests for BTreeSet<i64> {
    fn is_pending_cancel(&self, package_id: i64) -> bool {
        self.contains(&package_id)
    }
}

/// Format of the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[serde(rename = "zip")]
    Zip,

    #[serde(rename = "daf")]
    DupArchive,
}

/// Archive metadata, filled in by the archive builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub format: ArchiveFormat,

    /// Local path of the finished archive.
    pub path: Option<PathBuf>,

    /// Local path of the installer.
    pub installer_path: Option<PathBuf>,

    /// Size of the archive in bytes.
    ///
    /// Only authoritative once the package is no longer building.
    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub file_count: u64,

    #[serde(default)]
    pub dir_count: u64,
}

/// Database dump metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Number of tables in the source database.
    #[serde(default)]
    pub tables_total: u32,

    /// Number of tables left after filtering.
    #[serde(default)]
    pub tables_filtered: u32,

    #[serde(default)]
    pub rows: u64,

    /// Size of the dump in bytes.
    #[serde(default)]
    pub size: u64,

    /// Tables excluded from the dump.
    #[serde(default)]
    pub excluded_tables: Vec<String>,
}

/// A package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: i64,

    /// Unique hash, part of every file name the package produces.
    pub hash: String,

    pub name: String,

    pub created_at: DateTime<Utc>,

    status: PackageStatus,

    pub components: ComponentSet,

    pub archive: ArchiveInfo,

    pub database: DatabaseInfo,

    /// Upload records in creation order.
    ///
    /// A storage may appear more than once across retries and schedules.
    /// The last record of a storage is the current one.
    #[serde(default)]
    pub upload_infos: Vec<UploadInfo>,
}

/// Builds a new [`Package`].
#[derive(Debug)]
pub struct PackageBuilder {
    id: i64,
    name: String,
    hash: Option<String>,
    created_at: Option<DateTime<Utc>>,
    components: ComponentSet,
    format: ArchiveFormat,
    storages: Vec<i64>,
}

impl PackageBuilder {
    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn components(mut self, components: ComponentSet) -> Self {
        self.components = components;
        self
    }

    pub fn format(mut self, format: ArchiveFormat) -> Self {
        self.format = format;
        self
    }

    /// Adds a storage the package will be copied to.
    pub fn storage(mut self, storage_id: i64) -> Self {
        self.storages.push(storage_id);
        self
    }

    pub fn build(self) -> Package {
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        let hash = self
            .hash
            .unwrap_or_else(|| generate_hash(self.id, &created_at));

        Package {
            id: self.id,
            hash,
            name: self.name,
            created_at,
            status: PackageStatus::PRE_PROCESS,
            components: self.components,
            archive: ArchiveInfo {
                format: self.format,
                path: None,
                installer_path: None,
                size: 0,
                file_count: 0,
                dir_count: 0,
            },
            database: DatabaseInfo::default(),
            upload_infos: self.storages.into_iter().map(UploadInfo::new).collect(),
        }
    }
}

impl Package {
    pub fn builder(id: i64, name: impl Into<String>) -> PackageBuilder {
        PackageBuilder {
            id,
            name: name.into(),
            hash: None,
            created_at: None,
            components: ComponentSet::all(),
            format: ArchiveFormat::Zip,
            storages: Vec::new(),
        }
    }

    /// Returns the stored status.
    pub fn status(&self) -> PackageStatus {
        self.status
    }

    /// Advances the status.
    ///
    /// A negative status is terminal, and a successful run never goes
    /// backwards. Moving into a negative status is always allowed from a
    /// non-negative one.
    pub fn set_status(&mut self, status: PackageStatus) -> PackResult<()> {
        let current = self.status;

        if current.is_error() || (!status.is_error() && status < current) {
            return Err(PackError::InvalidStatusTransition {
                from: current,
                to: status,
            });
        }

        if status != current {
            tracing::debug!(package_id = self.id, from = %current, to = %status, "Package status changed");
        }

        self.status = status;
        Ok(())
    }

    /// Moves the package into a failure or cancellation state.
    pub fn fail(&mut self, status: PackageStatus) -> PackResult<()> {
        if !status.is_error() {
            return Err(PackError::NotAFailureStatus { status });
        }

        self.set_status(status)
    }

    /// Returns the status to display.
    ///
    /// A package waiting to be cancelled shows as pending cancel even
    /// though its stored status is untouched.
    pub fn display_status(&self, pending: &dyn CancelRequests) -> PackageStatus {
        if pending.is_pending_cancel(self.id) {
            PackageStatus::PENDING_CANCEL
        } else {
            self.status
        }
    }

    /// Returns whether the archive is still being produced.
    ///
    /// A package that has not started building yet is not building.
    pub fn is_building(&self) -> bool {
        self.status.is_building()
    }

    /// Common prefix of every file the package produces.
    pub fn name_hash(&self) -> String {
        format!("{}_{}", self.name, self.hash)
    }

    pub fn archive_file_name(&self) -> String {
        let ext = match self.archive.format {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::DupArchive => "daf",
        };

        format!("{}_archive.{}", self.name_hash(), ext)
    }

    pub fn installer_file_name(&self) -> String {
        format!("{}_installer.php", self.name_hash())
    }

    /// Returns the size of the archive.
    ///
    /// While the package is building, the recorded size is not final and
    /// the fragments in the temporary directory are summed instead. The
    /// builder may be writing or removing them concurrently, so anything
    /// that can't be read is skipped.
    pub fn archive_size(&self, temp_dir: &Path) -> u64 {
        if !self.is_building() {
            return self.archive.size;
        }

        let matcher = WildMatch::new(&format!("{}*", self.name_hash()));

        let entries = match fs::read_dir(temp_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Cannot read temporary directory {:?}: {}", temp_dir, e);
                return 0;
            }
        };

        entries
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| matcher.matches(name))
                    .unwrap_or(false)
            })
            .filter_map(|entry| entry.metadata().ok())
            .filter(|metadata| metadata.is_file())
            .map(|metadata| metadata.len())
            .sum()
    }

    /// Queues a new upload to a storage.
    pub fn add_upload(&mut self, storage_id: i64) -> &mut UploadInfo {
        self.upload_infos.push(UploadInfo::new(storage_id));
        let last = self.upload_infos.len() - 1;
        &mut self.upload_infos[last]
    }

    /// Returns the current upload record of a storage.
    pub fn latest_upload(&self, storage_id: i64) -> Option<&UploadInfo> {
        self.upload_infos
            .iter()
            .rev()
            .find(|info| info.storage_id == storage_id)
    }

    pub fn latest_upload_mut(&mut self, storage_id: i64) -> Option<&mut UploadInfo> {
        self.upload_infos
            .iter_mut()
            .rev()
            .find(|info| info.storage_id == storage_id)
    }

    /// Returns the current upload record of each storage, in order of
    /// first appearance.
    pub fn latest_uploads(&self) -> Vec<&UploadInfo> {
        let mut latest: Vec<&UploadInfo> = Vec::new();

        for info in &self.upload_infos {
            match latest.iter_mut().find(|l| l.storage_id == info.storage_id) {
                Some(slot) => *slot = info,
                None => latest.push(info),
            }
        }

        latest
    }

    /// Returns the storages with a current upload record.
    pub fn storage_ids(&self) -> Vec<i64> {
        self.latest_uploads()
            .into_iter()
            .map(|info| info.storage_id)
            .collect()
    }

    /// Average progress of the current uploads.
    ///
    /// Finished uploads count as complete whatever their outcome.
    pub fn transfer_percent(&self) -> f32 {
        let latest = self.latest_uploads();
        if latest.is_empty() {
            return 100.0;
        }

        let total: f32 = latest
            .iter()
            .map(|info| {
                if info.has_completed() {
                    100.0
                } else {
                    info.progress
                }
            })
            .sum();

        total / latest.len() as f32
    }

    /// Returns the final status once every current upload has finished.
    pub fn transfer_outcome(&self) -> Option<PackageStatus> {
        let latest = self.latest_uploads();

        if latest.iter().any(|info| !info.has_completed()) {
            return None;
        }

        let any_succeeded = latest
            .iter()
            .any(|info| info.status() == crate::upload::UploadStatus::Succeeded);
        let all_cancelled = !latest.is_empty() && latest.iter().all(|info| info.cancelled);

        if latest.is_empty() || any_succeeded {
            Some(PackageStatus::COMPLETE)
        } else if all_cancelled {
            Some(PackageStatus::STORAGE_CANCELLED)
        } else {
            Some(PackageStatus::STORAGE_FAILED)
        }
    }

    /// Prepares the package for another build run.
    ///
    /// Identity, name and configuration are kept, everything the previous
    /// run produced is dropped. The storages are queued again.
    pub fn reset_build_state(&mut self) {
        let storages = self.storage_ids();

        self.status = PackageStatus::PRE_PROCESS;
        self.archive = ArchiveInfo {
            format: self.archive.format,
            path: None,
            installer_path: None,
            size: 0,
            file_count: 0,
            dir_count: 0,
        };
        self.database.reset_counts();
        self.upload_infos = storages.into_iter().map(UploadInfo::new).collect();
    }
}

impl DatabaseInfo {
    /// Clears the figures of a previous dump, keeping the excluded tables.
    pub fn reset_counts(&mut self) {
        *self = Self {
            excluded_tables: std::mem::take(&mut self.excluded_tables),
            ..Self::default()
        };
    }
}

fn generate_hash(id: i64, created_at: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_le_bytes());
    hasher.update(created_at.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{}_{}", &digest[..20], created_at.format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests;
