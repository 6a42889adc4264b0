//! Package documents and uplink clients for the depot registry proxy.
//!
//! This crate defines the [`Package`] document shared by every other crate,
//! structural validation of uplink responses, the [`Uplink`] trait and the
//! HTTP implementation used for real registries.

pub mod error;
pub mod http;
pub mod http_client;
pub mod metadata;
pub mod package;
pub mod uplink;

pub use error::{ErrorContext, RegistryError, Result};
pub use metadata::{validate_metadata, RemoteMetadata};
pub use package::{DistFile, Package, UplinkCacheEntry};
pub use uplink::{SearchOptions, Uplink, UplinkRegistry};
