//! Error types for the registry crate.
//!
//! [`RegistryError`] covers failures talking to an uplink as well as
//! structural problems in the documents it returns.

use miette::Diagnostic;
use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Error, Diagnostic, Debug)]
pub enum RegistryError {
    #[error("Not modified")]
    #[diagnostic(code(depot_registry::not_modified))]
    NotModified,

    #[error("Uplink responded with status {status} for {url}")]
    #[diagnostic(
        code(depot_registry::status),
        help("Check that the uplink URL points at a package registry")
    )]
    Status { status: u16, url: String },

    #[error("Request failed: {message}")]
    #[diagnostic(
        code(depot_registry::transport),
        help("Check your network connection and the uplink URL")
    )]
    Transport {
        code: Option<String>,
        message: String,
    },

    #[error("Invalid package metadata: {0}")]
    #[diagnostic(
        code(depot_registry::validation),
        help("The uplink returned a document that is not valid package metadata")
    )]
    Validation(String),

    #[error(transparent)]
    #[diagnostic(
        code(depot_registry::json),
        help("The metadata document may be corrupted or in an invalid format")
    )]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    #[diagnostic(
        code(depot_registry::invalid_url),
        help("Ensure the URL is valid and properly formatted")
    )]
    InvalidUrl(String),

    #[error("Error while {action}: {source}")]
    #[diagnostic(code(depot_registry::io))]
    IoError {
        action: String,
        source: std::io::Error,
    },

    #[error("{0}")]
    #[diagnostic(code(depot_registry::custom))]
    Custom(String),
}

/// A specialized Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

impl RegistryError {
    /// Transport-level error code in npm style (`ETIMEDOUT`, `ECONNRESET`, ...).
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Transport {
                code, ..
            } => code.as_deref(),
            _ => None,
        }
    }

    /// HTTP-class status describing this error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NotModified => Some(304),
            Self::Status {
                status, ..
            } => Some(*status),
            Self::Validation(_) | Self::Json(_) => Some(502),
            Self::InvalidUrl(_) => Some(400),
            Self::Transport {
                ..
            }
            | Self::IoError {
                ..
            }
            | Self::Custom(_) => None,
        }
    }

    pub fn from_transport(err: ureq::Error) -> Self {
        let code = match &err {
            ureq::Error::Timeout(_) => Some("ETIMEDOUT"),
            ureq::Error::HostNotFound => Some("ENOTFOUND"),
            ureq::Error::ConnectionFailed => Some("ECONNREFUSED"),
            ureq::Error::Io(io) => io_error_code(io.kind()),
            _ => None,
        };

        Self::Transport {
            code: code.map(String::from),
            message: err.to_string(),
        }
    }

    /// A read failure on an already open response body.
    pub fn from_io(err: std::io::Error) -> Self {
        Self::Transport {
            code: io_error_code(err.kind()).map(String::from),
            message: err.to_string(),
        }
    }
}

fn io_error_code(kind: std::io::ErrorKind) -> Option<&'static str> {
    use std::io::ErrorKind;

    match kind {
        ErrorKind::TimedOut => Some("ETIMEDOUT"),
        ErrorKind::ConnectionReset => Some("ECONNRESET"),
        ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        ErrorKind::BrokenPipe => Some("EPIPE"),
        ErrorKind::UnexpectedEof => Some("ECONNRESET"),
        _ => None,
    }
}

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
            RegistryError::IoError {
                action: context(),
                source: err,
            }
        })
    }
}
