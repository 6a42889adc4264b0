//! In-memory storage backend, used for ephemeral caches and tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use depot_registry::{Package, SearchOptions};
use depot_utils::{
    stream::{RecordStream, TarballReader},
    time::now_millis,
};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    error::{Result, StorageError},
    record,
    traits::{LocalStorage, TarballWriter},
};

#[derive(Default)]
struct State {
    /// Package document and its last modification time in epoch millis.
    packages: BTreeMap<String, (Package, i64)>,
    tarballs: HashMap<(String, String), Bytes>,
    locals: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<State>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update_package<F>(&self, name: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut Package) -> Result<()> + Send,
    {
        record::validate_package_name(name)?;
        let mut state = self.state.write().await;
        let (stored, modified) = state
            .packages
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;

        let mut pkg = stored.clone();
        update(&mut pkg)?;
        record::bump_revision(&mut pkg);
        *stored = pkg;
        *modified = now_millis();
        Ok(())
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get_package_metadata(&self, name: &str) -> Result<Package> {
        record::validate_package_name(name)?;
        self.state
            .read()
            .await
            .packages
            .get(name)
            .map(|(pkg, _)| pkg.clone())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn add_package(&self, name: &str, mut package: Package) -> Result<Package> {
        record::validate_package_name(name)?;
        let mut state = self.state.write().await;
        if state.packages.contains_key(name) {
            return Err(StorageError::Conflict(format!("package `{name}` already exists")));
        }

        package.name = name.to_string();
        record::bump_revision(&mut package);
        state
            .packages
            .insert(name.to_string(), (package.clone(), now_millis()));
        if !state.locals.iter().any(|n| n == name) {
            state.locals.push(name.to_string());
        }
        Ok(package)
    }

    async fn update_versions(&self, name: &str, incoming: Package) -> Result<Package> {
        record::validate_package_name(name)?;
        let mut state = self.state.write().await;

        let mut local = state
            .packages
            .get(name)
            .map(|(pkg, _)| pkg.clone())
            .unwrap_or_else(|| Package::template(name));

        if record::apply_update(&mut local, &incoming) {
            record::bump_revision(&mut local);
            state
                .packages
                .insert(name.to_string(), (local.clone(), now_millis()));
        }
        local.provenance = incoming.provenance;

        Ok(local)
    }

    async fn add_version(
        &self,
        name: &str,
        version: &str,
        metadata: Value,
        tag: Option<&str>,
    ) -> Result<()> {
        self.update_package(name, |pkg| record::add_version(pkg, version, metadata, tag))
            .await
    }

    async fn merge_tags(&self, name: &str, tags: &BTreeMap<String, Option<String>>) -> Result<()> {
        self.update_package(name, |pkg| record::merge_tags(pkg, tags))
            .await
    }

    async fn change_package(
        &self,
        name: &str,
        incoming: Package,
        revision: Option<&str>,
    ) -> Result<()> {
        self.update_package(name, |pkg| {
            record::check_revision(pkg, revision)?;
            record::change_package(pkg, incoming);
            Ok(())
        })
        .await
    }

    async fn remove_package(&self, name: &str) -> Result<()> {
        record::validate_package_name(name)?;
        let mut state = self.state.write().await;
        if state.packages.remove(name).is_none() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        state.tarballs.retain(|(pkg, _), _| pkg != name);
        state.locals.retain(|n| n != name);
        Ok(())
    }

    async fn remove_tarball(&self, name: &str, filename: &str, revision: Option<&str>) -> Result<()> {
        record::validate_filename(filename)?;
        self.update_package(name, |pkg| {
            record::check_revision(pkg, revision)?;
            record::remove_attachment(pkg, filename)
        })
        .await?;

        self.state
            .write()
            .await
            .tarballs
            .remove(&(name.to_string(), filename.to_string()));
        Ok(())
    }

    async fn add_tarball(&self, name: &str, filename: &str) -> Result<Box<dyn TarballWriter>> {
        record::validate_package_name(name)?;
        record::validate_filename(filename)?;

        let key = (name.to_string(), filename.to_string());
        if self.state.read().await.tarballs.contains_key(&key) {
            return Err(StorageError::Conflict(format!("{name}/{filename}")));
        }

        Ok(Box::new(MemoryTarballWriter {
            state: self.state.clone(),
            key,
            buffer: BytesMut::new(),
            expected_length: None,
        }))
    }

    async fn get_tarball(&self, name: &str, filename: &str) -> Result<TarballReader<StorageError>> {
        record::validate_package_name(name)?;
        record::validate_filename(filename)?;

        let data = self
            .state
            .read()
            .await
            .tarballs
            .get(&(name.to_string(), filename.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{name}/{filename}")))?;

        let length = data.len() as u64;
        Ok(TarballReader::new(
            Some(length),
            futures::stream::iter([Ok(data)]).boxed(),
        ))
    }

    async fn search(
        &self,
        start_key: u64,
        options: &SearchOptions,
    ) -> Result<RecordStream<StorageError>> {
        let state = self.state.read().await;
        let records: Vec<Result<Value>> = state
            .packages
            .values()
            .filter(|(_, modified)| *modified > start_key as i64)
            .filter_map(|(pkg, modified)| record::search_record(pkg, *modified))
            .filter(|record| options.matches(record))
            .map(Ok)
            .collect();

        Ok(futures::stream::iter(records).boxed())
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.state.read().await.locals.clone())
    }
}

struct MemoryTarballWriter {
    state: Arc<RwLock<State>>,
    key: (String, String),
    buffer: BytesMut,
    expected_length: Option<u64>,
}

#[async_trait]
impl TarballWriter for MemoryTarballWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    fn set_content_length(&mut self, length: u64) {
        self.expected_length = Some(length);
    }

    async fn done(self: Box<Self>) -> Result<u64> {
        let size = self.buffer.len() as u64;
        if let Some(expected) = self.expected_length {
            if expected != size {
                return Err(StorageError::BadData(format!(
                    "{}/{}: expected {expected} bytes, received {size}",
                    self.key.0, self.key.1
                )));
            }
        }

        let Self {
            state,
            key,
            buffer,
            ..
        } = *self;
        let mut state = state.write().await;

        if state.tarballs.contains_key(&key) {
            return Err(StorageError::Conflict(format!("{}/{}", key.0, key.1)));
        }
        if let Some((pkg, _)) = state.packages.get_mut(&key.0) {
            record::record_attachment(pkg, &key.1, size);
        }
        state.tarballs.insert(key, buffer.freeze());
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
