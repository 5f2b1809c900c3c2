//! Package status.
//!
//! A package status is an ordered integer in three bands:
//!
//! - Negative values are terminal failure or cancellation states.
//! - Zero is pending: the build has not started yet.
//! - Positive values are build milestones, followed by the transfer band
//!   starting at [`PackageStatus::STORAGE_PROCESSING`] and finally
//!   [`PackageStatus::COMPLETE`].
//!
//! Values between two milestones are legal. The transfer daemon encodes
//! upload progress inside the transfer band, so a stored status may read
//! `87` while storages are being processed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The status of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageStatus(i32);

/// The band a status value falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBand {
    /// Failed or cancelled. Terminal.
    Failed,

    /// Not started yet.
    Pending,

    /// Archive and database dump are being built.
    Building,

    /// Built, being copied to storages.
    Transferring,

    /// Done.
    Complete,
}

/// Named milestones, in ascending order.
const MILESTONES: &[(PackageStatus, &str)] = &[
    (PackageStatus::REQUIREMENTS_FAILED, "requirements-failed"),
    (PackageStatus::STORAGE_FAILED, "storage-failed"),
    (PackageStatus::STORAGE_CANCELLED, "storage-cancelled"),
    (PackageStatus::PENDING_CANCEL, "pending-cancel"),
    (PackageStatus::BUILD_CANCELLED, "build-cancelled"),
    (PackageStatus::ERROR, "error"),
    (PackageStatus::PRE_PROCESS, "pending"),
    (PackageStatus::SCANNING, "scanning"),
    (PackageStatus::AFTER_SCAN, "scanned"),
    (PackageStatus::START, "started"),
    (PackageStatus::DB_START, "database-dump"),
    (PackageStatus::DB_DONE, "database-done"),
    (PackageStatus::ARC_START, "archiving"),
    (PackageStatus::ARC_VALIDATION, "validating-archive"),
    (PackageStatus::ARC_DONE, "archive-done"),
    (PackageStatus::COPIED_PACKAGE, "copied-package"),
    (PackageStatus::STORAGE_PROCESSING, "storage-processing"),
    (PackageStatus::COMPLETE, "complete"),
];

impl PackageStatus {
    pub const REQUIREMENTS_FAILED: Self = Self(-6);
    pub const STORAGE_FAILED: Self = Self(-5);
    pub const STORAGE_CANCELLED: Self = Self(-4);
    pub const PENDING_CANCEL: Self = Self(-3);
    pub const BUILD_CANCELLED: Self = Self(-2);
    pub const ERROR: Self = Self(-1);

    pub const PRE_PROCESS: Self = Self(0);

    pub const SCANNING: Self = Self(3);
    pub const AFTER_SCAN: Self = Self(5);
    pub const START: Self = Self(10);
    pub const DB_START: Self = Self(20);
    pub const DB_DONE: Self = Self(39);
    pub const ARC_START: Self = Self(40);
    pub const ARC_VALIDATION: Self = Self(60);
    pub const ARC_DONE: Self = Self(65);

    /// The archive and installer are in place. Anything below is still building.
    pub const COPIED_PACKAGE: Self = Self(70);

    /// Storages are being processed.
    pub const STORAGE_PROCESSING: Self = Self(75);

    pub const COMPLETE: Self = Self(100);

    /// Creates a status from its raw value.
    pub const fn from_raw(value: i32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn value(&self) -> i32 {
        self.0
    }

    pub fn band(&self) -> StatusBand {
        if self.0 < 0 {
            StatusBand::Failed
        } else if self.0 == 0 {
            StatusBand::Pending
        } else if *self < Self::COPIED_PACKAGE {
            StatusBand::Building
        } else if *self < Self::COMPLETE {
            StatusBand::Transferring
        } else {
            StatusBand::Complete
        }
    }

    pub fn is_complete(&self) -> bool {
        *self >= Self::COMPLETE
    }

    /// Returns whether this is a failure or cancellation state.
    pub fn is_error(&self) -> bool {
        self.0 < 0
    }

    /// Returns whether this is one of the failure states proper.
    ///
    /// Cancellations are negative too but are not failures.
    pub fn is_failure_band(&self) -> bool {
        matches!(
            *self,
            Self::ERROR | Self::STORAGE_FAILED | Self::REQUIREMENTS_FAILED
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            *self,
            Self::BUILD_CANCELLED | Self::PENDING_CANCEL | Self::STORAGE_CANCELLED
        )
    }

    pub fn is_pending(&self) -> bool {
        self.0 == 0
    }

    /// Returns whether the archive is still being produced.
    ///
    /// While building, the recorded archive size is not authoritative.
    pub fn is_building(&self) -> bool {
        self.0 > 0 && *self < Self::COPIED_PACKAGE
    }

    /// Returns whether the package is ready for or undergoing storage transfer.
    pub fn is_transferring(&self) -> bool {
        *self >= Self::COPIED_PACKAGE && *self < Self::COMPLETE
    }

    /// Maps an upload percentage into the transfer band.
    ///
    /// The result never reaches [`Self::COMPLETE`]; only the aggregate
    /// outcome of all storages may complete a package.
    pub fn transfer_progress(percent: f32) -> Self {
        let span = (Self::COMPLETE.0 - Self::STORAGE_PROCESSING.0) as f32;
        let percent = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
        let offset = (span * percent / 100.0).floor() as i32;

        Self((Self::STORAGE_PROCESSING.0 + offset).min(Self::COMPLETE.0 - 1))
    }

    /// Returns the name of the milestone at or below this value.
    pub fn label(&self) -> &'static str {
        MILESTONES
            .iter()
            .rev()
            .find(|(milestone, _)| milestone <= self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }
}

impl Default for PackageStatus {
    fn default() -> Self {
        Self::PRE_PROCESS
    }
}

impl From<i32> for PackageStatus {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.0)
    }
}
