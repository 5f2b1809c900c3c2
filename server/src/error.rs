//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use displaydoc::Display;

use sitepack::error::PackError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug, Display)]
pub enum ServerError {
    /// The requested package does not exist.
    NoSuchPackage,

    /// Unknown storage id {id}.
    NoSuchStorage { id: i64 },

    /// Storage id {id} is configured more than once.
    DuplicateStorage { id: i64 },

    /// The package has no local {what} to upload.
    MissingPackageFile { what: &'static str },

    /// Storage error: {0}
    StorageError(AnyError),

    /// Package store error: {0}
    StoreError(AnyError),

    /// Error from the common components.
    PackError(PackError),
}

impl ServerError {
    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn store_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StoreError(AnyError::new(error))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoSuchPackage => "NoSuchPackage",
            Self::NoSuchStorage { .. } => "NoSuchStorage",
            Self::DuplicateStorage { .. } => "DuplicateStorage",
            Self::MissingPackageFile { .. } => "MissingPackageFile",
            Self::StorageError(_) => "StorageError",
            Self::StoreError(_) => "StoreError",
            Self::PackError(e) => e.name(),
        }
    }
}

impl StdError for ServerError {}

impl From<PackError> for ServerError {
    fn from(error: PackError) -> Self {
        Self::PackError(error)
    }
}
