//! Local package storage for depot.
//!
//! Backends implement [`LocalStorage`]; the document manipulation they share
//! lives in [`record`].

pub mod error;
pub mod filesystem;
pub mod memory;
pub mod record;
pub mod traits;

pub use error::{ErrorContext, Result, StorageError};
pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;
pub use traits::{LocalStorage, TarballWriter};
