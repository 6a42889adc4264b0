//! Orchestration core of the depot registry proxy.
//!
//! [`StorageHandler`] answers package, tarball and search requests from
//! local storage, refreshing metadata from the configured uplinks and
//! caching tarballs fetched through them.

pub mod error;
mod fanout;
pub mod handler;
pub mod indexer;
pub mod merge;
pub mod search;
pub mod sync;
pub mod tarball;

pub use error::{DepotError, ErrorContext, Result};
pub use handler::{GetPackageOptions, HandlerSettings, PackageResponse, StorageHandler};
pub use indexer::{Indexer, MemoryIndexer, NullIndexer};
pub use search::{SearchFanIn, SearchStream};
pub use sync::{SyncFailure, SyncOptions, SyncOutcome, TimeoutClassifier, UplinkSyncEngine};
pub use tarball::{TarballProxyCache, TarballStream};
