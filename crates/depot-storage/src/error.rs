//! Error types for depot-storage.

use miette::Diagnostic;
use thiserror::Error;

/// Local storage error type.
#[derive(Error, Diagnostic, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    #[diagnostic(
        code(depot_storage::not_found),
        help("Check the package name, or fetch the package from an uplink first")
    )]
    NotFound(String),

    #[error("Already exists: {0}")]
    #[diagnostic(code(depot_storage::conflict))]
    Conflict(String),

    #[error("Bad request: {0}")]
    #[diagnostic(code(depot_storage::bad_request))]
    BadRequest(String),

    #[error("Corrupted data: {0}")]
    #[diagnostic(
        code(depot_storage::bad_data),
        help("The stored file may be corrupted. Remove it and fetch it again.")
    )]
    BadData(String),

    #[error("Error while {action}: {source}")]
    #[diagnostic(
        code(depot_storage::io),
        help("Check file permissions and disk space")
    )]
    IoError {
        action: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(depot_storage::json))]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// HTTP-class status describing this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::BadRequest(_) => 400,
            Self::BadData(_)
            | Self::IoError {
                ..
            }
            | Self::Json(_) => 500,
        }
    }
}

/// Result type alias for depot-storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

pub trait ErrorContext<T> {
    fn with_context<C>(self, context: C) -> Result<T>
    where
        C: FnOnce() -> String;
}

impl<T> ErrorContext<T> for std::io::Result<T> {
    fn with_context<C>(self, context: C) -> Result<T>
    where
        C: FnOnce() -> String,
    {
        self.map_err(|err| {
            StorageError::IoError {
                action: context(),
                source: err,
            }
        })
    }
}
