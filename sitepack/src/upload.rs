//! Per-storage upload tracking.
//!
//! Every storage a package is sent to gets its own [`UploadInfo`]. The
//! records share no state, so a failing storage never affects the others.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::GlobalSettings;

/// Storage ID of a record that was never assigned a storage.
pub const UNSET_STORAGE_ID: i64 = -1;

/// Derived status of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Human-readable texts a storage provides for each upload status.
pub trait StorageLabels {
    /// Display name of the storage.
    fn name(&self) -> &str;

    fn pending_text(&self) -> String {
        format!("Waiting to copy to {}", self.name())
    }

    fn running_text(&self) -> String {
        format!("Copying to {}", self.name())
    }

    fn succeeded_text(&self) -> String {
        format!("Copied package to {}", self.name())
    }

    fn failed_text(&self) -> String {
        format!("Failed to copy to {}", self.name())
    }

    fn cancelled_text(&self) -> String {
        format!("Cancelled copy to {}", self.name())
    }
}

/// Resolves storage IDs to their labels.
pub trait StorageLookup {
    fn labels(&self, storage_id: i64) -> Option<&dyn StorageLabels>;
}

/// Transfer progress of a package to one storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadInfo {
    /// The storage this record uploads to.
    pub storage_id: i64,

    /// Byte offset into the file currently being copied.
    ///
    /// The installer is copied first, then the archive. The offset is
    /// reset to zero between the two.
    #[serde(default)]
    pub offset: u64,

    #[serde(default)]
    pub copied_installer: bool,

    #[serde(default)]
    pub copied_archive: bool,

    /// Percentage of the archive copied, from 0 to 100.
    #[serde(default)]
    pub progress: f32,

    #[serde(default)]
    pub failure_count: u32,

    #[serde(default)]
    pub failed: bool,

    #[serde(default)]
    pub cancelled: bool,

    #[serde(default)]
    pub has_started: bool,

    pub started_at: Option<DateTime<Utc>>,

    pub stopped_at: Option<DateTime<Utc>>,

    /// Opaque backend continuation data.
    pub data: Option<String>,

    /// More opaque backend continuation data.
    pub data2: Option<String>,

    /// Backend-specific chunk cursor.
    pub chunk_position: Option<i64>,

    /// Details appended to the status message.
    #[serde(default)]
    pub status_message_details: String,
}

impl UploadInfo {
    pub fn new(storage_id: i64) -> Self {
        Self {
            storage_id,
            ..Default::default()
        }
    }

    /// Derives the status from the flags.
    ///
    /// Cancelled wins over failed, failed over not started.
    pub fn status(&self) -> UploadStatus {
        if self.cancelled {
            UploadStatus::Cancelled
        } else if self.failed {
            UploadStatus::Failed
        } else if !self.has_started {
            UploadStatus::Pending
        } else if self.copied_installer && self.copied_archive {
            UploadStatus::Succeeded
        } else {
            UploadStatus::Running
        }
    }

    /// Marks the upload as started. Only the first call records the time.
    pub fn start(&mut self) {
        if !self.has_started {
            self.has_started = true;
            self.started_at = Some(Utc::now());
        }
    }

    /// Returns whether no further transfer will happen for this storage.
    pub fn has_completed(&self) -> bool {
        matches!(
            self.status(),
            UploadStatus::Succeeded | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }

    /// Records the stop time the first time the upload is seen terminal.
    ///
    /// Returns `true` only for the call that recorded it.
    pub fn mark_terminal(&mut self) -> bool {
        if self.stopped_at.is_some() || !self.has_completed() {
            return false;
        }

        self.stopped_at = Some(Utc::now());
        tracing::info!(
            storage_id = self.storage_id,
            status = ?self.status(),
            "Upload stopped"
        );

        true
    }

    /// Counts one failed attempt.
    ///
    /// Returns `true` if this attempt pushed the record into the failed state.
    pub fn increase_failure_count(&mut self, settings: &GlobalSettings) -> bool {
        self.failure_count += 1;

        tracing::warn!(
            storage_id = self.storage_id,
            failure_count = self.failure_count,
            max_retries = settings.max_storage_retries,
            "Upload attempt failed"
        );

        if !self.failed && self.failure_count > settings.max_storage_retries {
            tracing::error!(
                storage_id = self.storage_id,
                "Too many failures, giving up on this storage"
            );
            self.failed = true;
            return true;
        }

        false
    }

    /// Fails the upload immediately.
    pub fn fail_fatally(&mut self, details: impl Into<String>) {
        self.failed = true;
        self.status_message_details = details.into();
        self.reset_transfer();
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Forgets the resume point so the next attempt starts from scratch.
    pub fn reset_transfer(&mut self) {
        self.offset = 0;
        self.data = None;
        self.data2 = None;
        self.chunk_position = None;
    }

    pub fn set_progress(&mut self, percent: f32) {
        self.progress = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
    }

    /// Composes the human-readable status of this upload.
    pub fn status_message(&self, storages: &dyn StorageLookup) -> String {
        let labels = match storages.labels(self.storage_id) {
            Some(labels) => labels,
            None => {
                tracing::error!(storage_id = self.storage_id, "Unknown storage id");
                return format!("Error. Unknown storage id {}", self.storage_id);
            }
        };

        let text = match self.status() {
            UploadStatus::Pending => labels.pending_text(),
            UploadStatus::Running => labels.running_text(),
            UploadStatus::Succeeded => labels.succeeded_text(),
            UploadStatus::Failed => labels.failed_text(),
            UploadStatus::Cancelled => labels.cancelled_text(),
        };

        if self.status_message_details.is_empty() {
            text
        } else {
            format!("{} ({})", text, self.status_message_details)
        }
    }
}

impl Default for UploadInfo {
    fn default() -> Self {
        Self {
            storage_id: UNSET_STORAGE_ID,
            offset: 0,
            copied_installer: false,
            copied_archive: false,
            progress: 0.0,
            failure_count: 0,
            failed: false,
            cancelled: false,
            has_started: false,
            started_at: None,
            stopped_at: None,
            data: None,
            data2: None,
            chunk_position: None,
            status_message_details: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    struct Labels(String);

    impl StorageLabels for Labels {
        fn name(&self) -> &str {
            &self.0
        }
    }

    struct Storages(HashMap<i64, Labels>);

    impl StorageLookup for Storages {
        fn labels(&self, storage_id: i64) -> Option<&dyn StorageLabels> {
            self.0.get(&storage_id).map(|l| l as &dyn StorageLabels)
        }
    }

    fn storages() -> Storages {
        let mut map = HashMap::new();
        map.insert(1, Labels("Local".to_string()));
        Storages(map)
    }

    #[test]
    fn test_default_is_unset() {
        let info = UploadInfo::default();
        assert_eq!(UNSET_STORAGE_ID, info.storage_id);
        assert_eq!(UploadStatus::Pending, info.status());
    }

    #[test]
    fn test_status_precedence() {
        for bits in 0u8..32 {
            let info = UploadInfo {
                cancelled: bits & 1 != 0,
                failed: bits & 2 != 0,
                has_started: bits & 4 != 0,
                copied_installer: bits & 8 != 0,
                copied_archive: bits & 16 != 0,
                ..UploadInfo::new(1)
            };

            let expected = if info.cancelled {
                UploadStatus::Cancelled
            } else if info.failed {
                UploadStatus::Failed
            } else if !info.has_started {
                UploadStatus::Pending
            } else if info.copied_installer && info.copied_archive {
                UploadStatus::Succeeded
            } else {
                UploadStatus::Running
            };

            assert_eq!(expected, info.status(), "flags {:05b}", bits);
        }
    }

    #[test]
    fn test_failure_escalation() {
        let settings = GlobalSettings {
            max_storage_retries: 3,
        };
        let mut info = UploadInfo::new(1);

        for _ in 0..3 {
            assert!(!info.increase_failure_count(&settings));
        }
        assert!(!info.failed);

        assert!(info.increase_failure_count(&settings));
        assert!(info.failed);
        assert_eq!(UploadStatus::Failed, info.status());

        // already failed, doesn't escalate again
        assert!(!info.increase_failure_count(&settings));
    }

    #[test]
    fn test_failure_isolation() {
        let settings = GlobalSettings {
            max_storage_retries: 0,
        };
        let mut a = UploadInfo::new(1);
        let b = UploadInfo::new(2);

        a.increase_failure_count(&settings);
        assert!(a.failed);
        assert!(!b.failed);
        assert_eq!(0, b.failure_count);
    }

    #[test]
    fn test_mark_terminal_once() {
        let mut info = UploadInfo::new(1);
        info.start();
        assert!(!info.mark_terminal());
        assert!(info.stopped_at.is_none());

        info.copied_installer = true;
        info.copied_archive = true;
        assert!(info.has_completed());
        assert!(info.mark_terminal());

        let stopped_at = info.stopped_at;
        assert!(stopped_at.is_some());

        // a later cancellation doesn't move the stop time
        info.cancel();
        assert!(!info.mark_terminal());
        assert!(info.has_completed());
        assert_eq!(stopped_at, info.stopped_at);
    }

    #[test]
    fn test_start_once() {
        let mut info = UploadInfo::new(1);
        info.start();
        let started_at = info.started_at;
        info.start();
        assert_eq!(started_at, info.started_at);
    }

    #[test]
    fn test_status_message() {
        let storages = storages();

        let mut info = UploadInfo::new(1);
        assert_eq!("Waiting to copy to Local", info.status_message(&storages));

        info.start();
        assert_eq!("Copying to Local", info.status_message(&storages));

        info.fail_fatally("size mismatch");
        assert_eq!(
            "Failed to copy to Local (size mismatch)",
            info.status_message(&storages)
        );

        info.cancel();
        assert_eq!(
            "Cancelled copy to Local (size mismatch)",
            info.status_message(&storages)
        );
    }

    #[test]
    fn test_status_message_unknown_storage() {
        let storages = storages();
        let info = UploadInfo::new(42);
        assert_eq!("Error. Unknown storage id 42", info.status_message(&storages));

        let info = UploadInfo::default();
        assert_eq!("Error. Unknown storage id -1", info.status_message(&storages));
    }

    #[test]
    fn test_fail_fatally_resets_resume_point() {
        let mut info = UploadInfo::new(1);
        info.offset = 1024;
        info.data = Some("upload-id".to_string());
        info.chunk_position = Some(3);

        info.fail_fatally("seek failed");
        assert!(info.failed);
        assert_eq!(0, info.offset);
        assert!(info.data.is_none());
        assert!(info.chunk_position.is_none());
    }

    #[test]
    fn test_serde_defaults() {
        let info: UploadInfo =
            serde_json::from_str(r#"{"storage_id": 3, "started_at": null, "stopped_at": null, "data": null, "data2": null, "chunk_position": null}"#)
                .unwrap();
        assert_eq!(UploadInfo::new(3), info);
    }
}
