//! Contracts every local storage backend fulfils.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use depot_registry::{Package, SearchOptions};
use depot_utils::stream::{RecordStream, TarballReader};
use serde_json::Value;

use crate::error::{Result, StorageError};

/// A tarball being written into local storage.
///
/// Nothing becomes visible to readers until [`TarballWriter::done`]
/// succeeds; [`TarballWriter::abort`] discards everything written so far.
#[async_trait]
pub trait TarballWriter: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Declares the expected size, verified on [`TarballWriter::done`].
    fn set_content_length(&mut self, length: u64);

    async fn done(self: Box<Self>) -> Result<u64>;

    async fn abort(self: Box<Self>) -> Result<()>;
}

/// The authoritative local store of package documents and tarballs.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn get_package_metadata(&self, name: &str) -> Result<Package>;

    /// Stores a newly published package and records it as locally published.
    /// Fails with `Conflict` when the package already exists.
    async fn add_package(&self, name: &str, package: Package) -> Result<Package>;

    /// Merges a synced package into the stored one, creating it if needed.
    /// Writes only when something changed. Returns the stored document.
    async fn update_versions(&self, name: &str, incoming: Package) -> Result<Package>;

    async fn add_version(
        &self,
        name: &str,
        version: &str,
        metadata: Value,
        tag: Option<&str>,
    ) -> Result<()>;

    /// Points tags at versions; `None` removes the tag.
    async fn merge_tags(&self, name: &str, tags: &BTreeMap<String, Option<String>>) -> Result<()>;

    /// Replaces dist-tags and users, dropping versions `incoming` no longer lists.
    async fn change_package(
        &self,
        name: &str,
        incoming: Package,
        revision: Option<&str>,
    ) -> Result<()>;

    async fn remove_package(&self, name: &str) -> Result<()>;

    async fn remove_tarball(&self, name: &str, filename: &str, revision: Option<&str>) -> Result<()>;

    async fn add_tarball(&self, name: &str, filename: &str) -> Result<Box<dyn TarballWriter>>;

    async fn get_tarball(&self, name: &str, filename: &str) -> Result<TarballReader<StorageError>>;

    /// Summaries of packages modified after `start_key` (epoch millis).
    async fn search(
        &self,
        start_key: u64,
        options: &SearchOptions,
    ) -> Result<RecordStream<StorageError>>;

    /// Locally published package names, in publication order.
    async fn list_names(&self) -> Result<Vec<String>>;
}
