//! The storage entry points a registry frontend talks to.

use std::{collections::BTreeMap, sync::Arc};

use depot_config::{config::Config, packages::PackageRules};
use depot_registry::{Package, SearchOptions, UplinkRegistry};
use depot_storage::{FilesystemStorage, LocalStorage, TarballWriter};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::{DepotError, Result},
    indexer::Indexer,
    merge::{clean_up_uplink_refs, normalize_dist_tags},
    search::{SearchFanIn, SearchStream},
    sync::{SyncFailure, SyncOptions, TimeoutClassifier, UplinkSyncEngine},
    tarball::{TarballProxyCache, TarballStream},
};

#[derive(Clone, Debug, Default)]
pub struct GetPackageOptions {
    pub name: String,

    /// `Some(false)` answers from local storage only.
    pub uplinks_look: Option<bool>,

    /// Keep `_uplinks` freshness stamps in the returned document.
    pub keep_uplink_data: bool,

    /// Etag the client sent, forwarded to uplinks without a cache entry.
    pub etag: Option<String>,
}

impl GetPackageOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A package document ready for clients, with the errors individual
/// uplinks reported while refreshing it.
#[derive(Debug)]
pub struct PackageResponse {
    pub package: Package,
    pub uplink_errors: Vec<Option<DepotError>>,
}

#[derive(Clone, Debug, Default)]
pub struct HandlerSettings {
    /// Accept publishes while uplinks are unreachable.
    pub allow_offline: bool,
    pub classifier: TimeoutClassifier,
}

impl HandlerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            allow_offline: config.allow_offline_publish(),
            classifier: TimeoutClassifier::from_codes(config.timeout_codes()),
        }
    }
}

/// Combines local storage and uplinks into one package store.
pub struct StorageHandler {
    storage: Arc<dyn LocalStorage>,
    uplinks: Arc<UplinkRegistry>,
    indexer: Arc<dyn Indexer>,
    sync: Arc<UplinkSyncEngine>,
    tarballs: TarballProxyCache,
    search: SearchFanIn,
    allow_offline: bool,
}

impl StorageHandler {
    pub fn new(
        storage: Arc<dyn LocalStorage>,
        uplinks: Arc<UplinkRegistry>,
        rules: PackageRules,
        indexer: Arc<dyn Indexer>,
        settings: HandlerSettings,
    ) -> Self {
        let sync = Arc::new(UplinkSyncEngine::new(
            uplinks.clone(),
            rules,
            storage.clone(),
            settings.classifier,
        ));
        let tarballs = TarballProxyCache::new(uplinks.clone(), storage.clone(), sync.clone());
        let search = SearchFanIn::new(uplinks.clone(), storage.clone());

        Self {
            storage,
            uplinks,
            indexer,
            sync,
            tarballs,
            search,
            allow_offline: settings.allow_offline,
        }
    }

    /// Filesystem storage and HTTP uplinks as described by `config`.
    pub async fn from_config(config: &Config, indexer: Arc<dyn Indexer>) -> Result<Self> {
        let storage = FilesystemStorage::new(config.get_storage_path()).await?;
        let uplinks = UplinkRegistry::from_config(config)?;

        debug!(
            storage = %storage.root().display(),
            uplinks = uplinks.len(),
            "storage handler ready"
        );

        Ok(Self::new(
            Arc::new(storage),
            Arc::new(uplinks),
            config.package_rules(),
            indexer,
            HandlerSettings::from_config(config),
        ))
    }

    pub fn storage(&self) -> &Arc<dyn LocalStorage> {
        &self.storage
    }

    pub fn uplinks(&self) -> &Arc<UplinkRegistry> {
        &self.uplinks
    }

    /// Publishes a new package.
    ///
    /// # Errors
    ///
    /// [`DepotError::Conflict`] when the package exists locally or on an
    /// uplink, [`DepotError::ServiceUnavailable`] when an uplink could not
    /// answer and offline publishing is disabled.
    pub async fn add_package(&self, name: &str, manifest: Package) -> Result<()> {
        match self.storage.get_package_metadata(name).await {
            Ok(_) => return Err(DepotError::Conflict(format!("package `{name}` already exists"))),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        self.check_remote(name).await?;

        let stored = self.storage.add_package(name, manifest).await?;
        if let Some(latest) = stored.latest_manifest() {
            self.indexer.add(latest);
        }

        info!(package = name, "package published");
        Ok(())
    }

    async fn check_remote(&self, name: &str) -> Result<()> {
        let options = SyncOptions {
            uplinks_look: Some(true),
            etag: None,
        };

        let (unavailable, uplink_errors) = match self.sync.sync(name, None, &options).await {
            Ok(_) => {
                return Err(DepotError::Conflict(format!(
                    "package `{name}` already exists on an uplink"
                )));
            }
            Err(SyncFailure {
                error: DepotError::NotFound(_),
                uplink_errors,
            }) => (false, uplink_errors),
            Err(SyncFailure {
                error: DepotError::ServiceUnavailable(_),
                uplink_errors,
            }) => (true, uplink_errors),
            Err(failure) => return Err(failure.error),
        };

        let uplink_down = unavailable
            || uplink_errors
                .iter()
                .flatten()
                .any(|err| err.status() != Some(404));

        if !uplink_down {
            return Ok(());
        }
        if self.allow_offline {
            warn!(package = name, "publishing while an uplink is unreachable");
            return Ok(());
        }
        Err(DepotError::ServiceUnavailable(name.to_string()))
    }

    pub async fn add_version(
        &self,
        name: &str,
        version: &str,
        metadata: Value,
        tag: Option<&str>,
    ) -> Result<()> {
        Ok(self.storage.add_version(name, version, metadata, tag).await?)
    }

    pub async fn merge_tags(&self, name: &str, tags: &BTreeMap<String, Option<String>>) -> Result<()> {
        Ok(self.storage.merge_tags(name, tags).await?)
    }

    pub async fn change_package(
        &self,
        name: &str,
        manifest: Package,
        revision: Option<&str>,
    ) -> Result<()> {
        Ok(self.storage.change_package(name, manifest, revision).await?)
    }

    /// Removes a package locally. The indexer is told in every case.
    pub async fn remove_package(&self, name: &str) -> Result<()> {
        let result = self.storage.remove_package(name).await;
        self.indexer.remove(name);
        Ok(result?)
    }

    pub async fn remove_tarball(&self, name: &str, filename: &str, revision: Option<&str>) -> Result<()> {
        Ok(self.storage.remove_tarball(name, filename, revision).await?)
    }

    pub async fn add_tarball(&self, name: &str, filename: &str) -> Result<Box<dyn TarballWriter>> {
        Ok(self.storage.add_tarball(name, filename).await?)
    }

    pub async fn get_tarball(&self, name: &str, filename: &str) -> Result<TarballStream> {
        self.tarballs.fetch(name, filename).await
    }

    /// The package document for clients, refreshed from uplinks.
    pub async fn get_package(&self, options: &GetPackageOptions) -> Result<PackageResponse> {
        let name = options.name.as_str();

        let local = match self.storage.get_package_metadata(name).await {
            Ok(package) => Some(package),
            Err(err) if err.status() < 500 => None,
            Err(err) => return Err(err.into()),
        };

        let sync_options = SyncOptions {
            uplinks_look: options.uplinks_look,
            etag: options.etag.clone(),
        };
        let outcome = self.sync.sync(name, local, &sync_options).await?;

        let mut package = outcome.package;
        clean_up_uplink_refs(&mut package, options.keep_uplink_data);
        normalize_dist_tags(&mut package);
        package.attachments.clear();

        Ok(PackageResponse {
            package,
            uplink_errors: outcome.uplink_errors,
        })
    }

    /// Latest manifests of every locally published package, in publication
    /// order.
    pub async fn get_local_database(&self) -> Result<Vec<Value>> {
        let names = self.storage.list_names().await?;
        let mut manifests = Vec::with_capacity(names.len());

        for name in names {
            let package = match self.storage.get_package_metadata(&name).await {
                Ok(package) => package,
                Err(err) => {
                    warn!(package = %name, error = %err, "skipping unreadable package");
                    continue;
                }
            };

            let (Some(latest), Some(manifest)) = (package.latest(), package.latest_manifest()) else {
                warn!(package = %name, "package has no usable `latest` tag");
                continue;
            };

            let mut manifest = manifest.clone();
            if let Some(object) = manifest.as_object_mut() {
                if let Some(time) = package.time.get(latest) {
                    object.insert("time".to_string(), time.clone());
                }
                if let Some(users) = package.extra.get("users") {
                    object.insert("users".to_string(), users.clone());
                }
            }
            manifests.push(manifest);
        }

        Ok(manifests)
    }

    pub fn search(&self, start_key: u64, options: SearchOptions) -> SearchStream {
        self.search.search(start_key, options)
    }
}
