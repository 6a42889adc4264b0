//! Error types for depot-core.

use depot_config::error::ConfigError;
use depot_registry::RegistryError;
use depot_storage::StorageError;
use miette::Diagnostic;
use thiserror::Error;

/// Core error type for registry proxy operations.
///
/// `Diagnostic` is implemented by hand below: the derive forwards
/// transparent variants via `field.code()`, which resolves to
/// `RegistryError`'s inherent `code()` instead of the trait method.
#[derive(Error, Debug)]
pub enum DepotError {
    #[error("Package '{0}' not found")]
    NotFound(String),

    #[error("No uplink is reachable for '{0}'")]
    ServiceUnavailable(String),

    #[error("Invalid upstream metadata: {0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Error while {action}")]
    IoError {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Internal(String),
}

impl Diagnostic for DepotError {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        match self {
            Self::NotFound(_) => Some(Box::new("depot::not_found")),
            Self::ServiceUnavailable(_) => Some(Box::new("depot::service_unavailable")),
            Self::Validation(_) => Some(Box::new("depot::validation")),
            Self::Conflict(_) => Some(Box::new("depot::conflict")),
            Self::BadRequest(_) => Some(Box::new("depot::bad_request")),
            Self::Storage(err) => Diagnostic::code(err),
            Self::Registry(err) => Diagnostic::code(err),
            Self::Config(err) => Diagnostic::code(err),
            Self::IoError {
                ..
            } => Some(Box::new("depot::io")),
            Self::Internal(_) => Some(Box::new("depot::internal")),
        }
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        match self {
            Self::NotFound(_) => {
                Some(Box::new("Check the package name and the `packages` proxy rules"))
            }
            Self::ServiceUnavailable(_) => {
                Some(Box::new(
                    "Check your network connection, or publish with `publish.allow_offline`",
                ))
            }
            Self::Storage(err) => Diagnostic::help(err),
            Self::Registry(err) => Diagnostic::help(err),
            Self::Config(err) => Diagnostic::help(err),
            Self::IoError {
                ..
            } => Some(Box::new("Check file permissions and disk space")),
            Self::Internal(_) => Some(Box::new("This is an internal error, please report it")),
            _ => None,
        }
    }

    fn severity(&self) -> Option<miette::Severity> {
        match self {
            Self::Storage(err) => Diagnostic::severity(err),
            Self::Registry(err) => Diagnostic::severity(err),
            Self::Config(err) => Diagnostic::severity(err),
            _ => None,
        }
    }

    fn url<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        match self {
            Self::Storage(err) => Diagnostic::url(err),
            Self::Registry(err) => Diagnostic::url(err),
            Self::Config(err) => Diagnostic::url(err),
            _ => None,
        }
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        match self {
            Self::Storage(err) => Diagnostic::source_code(err),
            Self::Registry(err) => Diagnostic::source_code(err),
            Self::Config(err) => Diagnostic::source_code(err),
            _ => None,
        }
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = miette::LabeledSpan> + '_>> {
        match self {
            Self::Storage(err) => Diagnostic::labels(err),
            Self::Registry(err) => Diagnostic::labels(err),
            Self::Config(err) => Diagnostic::labels(err),
            _ => None,
        }
    }

    fn related<'a>(&'a self) -> Option<Box<dyn Iterator<Item = &'a dyn Diagnostic> + 'a>> {
        match self {
            Self::Storage(err) => Diagnostic::related(err),
            Self::Registry(err) => Diagnostic::related(err),
            Self::Config(err) => Diagnostic::related(err),
            _ => None,
        }
    }

    fn diagnostic_source(&self) -> Option<&dyn Diagnostic> {
        match self {
            Self::Storage(err) => Diagnostic::diagnostic_source(err),
            Self::Registry(err) => Diagnostic::diagnostic_source(err),
            Self::Config(err) => Diagnostic::diagnostic_source(err),
            _ => None,
        }
    }
}

impl DepotError {
    /// HTTP-class status describing this error, when one applies.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) => Some(404),
            Self::ServiceUnavailable(_) => Some(503),
            Self::Validation(_) => Some(502),
            Self::Conflict(_) => Some(409),
            Self::BadRequest(_) => Some(400),
            Self::Storage(err) => Some(err.status()),
            Self::Registry(err) => err.status(),
            Self::Config(_)
            | Self::IoError {
                ..
            }
            | Self::Internal(_) => Some(500),
        }
    }

    /// Transport error code (`ETIMEDOUT`, `ECONNRESET`, ...), when known.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Registry(err) => err.code(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Storage(err) => err.is_not_found(),
            _ => false,
        }
    }
}

/// Result type alias for depot-core operations.
pub type Result<T> = std::result::Result<T, DepotError>;

/// Extension trait for adding context to I/O errors.
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
            DepotError::IoError {
                action: context(),
                source: err,
            }
        })
    }
}
