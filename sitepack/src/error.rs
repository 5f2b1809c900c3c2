//! Error handling.

use std::error::Error as StdError;

use displaydoc::Display;

use crate::status::PackageStatus;

pub type PackResult<T> = Result<T, PackError>;

/// An error.
#[derive(Debug, Display)]
pub enum PackError {
    /// Invalid package status transition from {from} to {to}
    InvalidStatusTransition {
        from: PackageStatus,
        to: PackageStatus,
    },

    /// Package status {status} is not a failure state
    NotAFailureStatus { status: PackageStatus },

    /// Invalid installation topology "{value}"
    InvalidTopology { value: String },

    /// The installation topology is not set
    TopologyNotSet,

    /// Subsite {subsite_id} has no destination mapping
    MissingSubsiteMapping { subsite_id: i64 },

    /// Subsite {subsite_id} is mapped to a site that does not exist yet
    UnresolvedSubsiteTarget { subsite_id: i64 },

    /// Invalid component "{name}"
    InvalidComponent { name: String },
}

impl PackError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidStatusTransition { .. } => "InvalidStatusTransition",
            Self::NotAFailureStatus { .. } => "NotAFailureStatus",
            Self::InvalidTopology { .. } => "InvalidTopology",
            Self::TopologyNotSet => "TopologyNotSet",
            Self::MissingSubsiteMapping { .. } => "MissingSubsiteMapping",
            Self::UnresolvedSubsiteTarget { .. } => "UnresolvedSubsiteTarget",
            Self::InvalidComponent { .. } => "InvalidComponent",
        }
    }

    /// Returns whether the error must halt the installer step.
    ///
    /// There is no safe default for a broken topology configuration.
    pub fn is_fatal_global(&self) -> bool {
        matches!(
            self,
            Self::InvalidTopology { .. }
                | Self::TopologyNotSet
                | Self::MissingSubsiteMapping { .. }
                | Self::UnresolvedSubsiteTarget { .. }
        )
    }
}

impl StdError for PackError {}
