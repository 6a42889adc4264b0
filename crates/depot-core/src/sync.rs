//! One metadata sync round against every eligible uplink.

use std::{fmt, sync::Arc};

use depot_config::{config::DEFAULT_TIMEOUT_CODES, packages::PackageRules};
use depot_registry::{
    Package, RegistryError, RemoteMetadata, Uplink, UplinkCacheEntry, UplinkRegistry,
};
use depot_storage::LocalStorage;
use depot_utils::time::now_millis;
use futures::future::join_all;
use tracing::{debug, trace, warn};

use crate::{error::DepotError, merge::merge_uplink_metadata};

/// Decides which uplink errors mean "the registry is unreachable" rather
/// than "the package does not exist".
#[derive(Clone)]
pub struct TimeoutClassifier {
    predicate: Arc<dyn Fn(&DepotError) -> bool + Send + Sync>,
}

impl TimeoutClassifier {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&DepotError) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Classifies by transport error code.
    pub fn from_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let codes: Vec<String> = codes.into_iter().map(Into::into).collect();
        Self::new(move |err| err.code().is_some_and(|code| codes.iter().any(|c| c == code)))
    }

    pub fn is_timeout(&self, err: &DepotError) -> bool {
        (self.predicate)(err)
    }
}

impl Default for TimeoutClassifier {
    fn default() -> Self {
        Self::from_codes(DEFAULT_TIMEOUT_CODES.iter().copied())
    }
}

impl fmt::Debug for TimeoutClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutClassifier").finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SyncOptions {
    /// `Some(false)` skips every uplink.
    pub uplinks_look: Option<bool>,

    /// Etag sent to uplinks that have no cache entry yet.
    pub etag: Option<String>,
}

#[derive(Debug)]
pub struct SyncOutcome {
    pub package: Package,

    /// Number of uplinks actually asked; fresh cache entries do not count.
    pub queried: usize,

    /// One slot per eligible uplink, in uplink order. Empty when no uplink
    /// was queried.
    pub uplink_errors: Vec<Option<DepotError>>,
}

#[derive(Debug)]
pub struct SyncFailure {
    pub error: DepotError,
    pub uplink_errors: Vec<Option<DepotError>>,
}

impl From<SyncFailure> for DepotError {
    fn from(failure: SyncFailure) -> Self {
        failure.error
    }
}

enum UplinkResponse {
    Fresh,
    NotModified {
        etag: Option<String>,
        fetched: i64,
    },
    Data {
        metadata: RemoteMetadata,
        fetched: i64,
    },
    Failed(DepotError),
}

/// Refreshes a package's metadata from the uplinks it is proxied to.
pub struct UplinkSyncEngine {
    uplinks: Arc<UplinkRegistry>,
    rules: PackageRules,
    storage: Arc<dyn LocalStorage>,
    classifier: TimeoutClassifier,
}

impl UplinkSyncEngine {
    pub fn new(
        uplinks: Arc<UplinkRegistry>,
        rules: PackageRules,
        storage: Arc<dyn LocalStorage>,
        classifier: TimeoutClassifier,
    ) -> Self {
        Self {
            uplinks,
            rules,
            storage,
            classifier,
        }
    }

    /// Uplinks `name` is proxied to, in configuration order.
    pub fn eligible_uplinks(&self, name: &str) -> Vec<Arc<dyn Uplink>> {
        self.uplinks
            .iter()
            .filter(|uplink| self.rules.has_proxy_to(name, uplink.name()))
            .cloned()
            .collect()
    }

    /// Runs one sync round for `name`, starting from the stored document
    /// `local` (if any).
    ///
    /// All eligible uplinks are asked concurrently; their documents are then
    /// merged one at a time in uplink order. When at least one uplink was
    /// asked the merged document is written back through
    /// [`LocalStorage::update_versions`].
    ///
    /// # Errors
    ///
    /// Fails with [`DepotError::NotFound`] or
    /// [`DepotError::ServiceUnavailable`] when neither local storage nor any
    /// uplink knows the package, and with the storage error when the write
    /// back fails.
    pub async fn sync(
        &self,
        name: &str,
        local: Option<Package>,
        options: &SyncOptions,
    ) -> Result<SyncOutcome, SyncFailure> {
        let (mut package, mut found) = match local {
            Some(package) => (package, true),
            None => (Package::template(name), false),
        };

        let eligible = if options.uplinks_look == Some(false) {
            Vec::new()
        } else {
            self.eligible_uplinks(name)
        };

        let plans: Vec<(Arc<dyn Uplink>, Option<UplinkCacheEntry>)> = eligible
            .into_iter()
            .map(|uplink| {
                let cached = package.uplinks.get(uplink.name()).cloned();
                (uplink, cached)
            })
            .collect();

        let responses = join_all(plans.iter().map(|(uplink, cached)| {
            query_uplink(uplink.as_ref(), name, cached.as_ref(), options.etag.as_deref())
        }))
        .await;

        let mut queried = 0;
        let mut uplink_errors = Vec::with_capacity(plans.len());

        for ((uplink, _), response) in plans.iter().zip(responses) {
            match response {
                UplinkResponse::Fresh => uplink_errors.push(None),
                UplinkResponse::NotModified {
                    etag,
                    fetched,
                } => {
                    queried += 1;
                    package
                        .uplinks
                        .entry(uplink.name().to_string())
                        .or_insert_with(|| {
                            UplinkCacheEntry {
                                etag,
                                fetched,
                            }
                        })
                        .fetched = fetched;
                    uplink_errors.push(None);
                }
                UplinkResponse::Data {
                    metadata,
                    fetched,
                } => {
                    queried += 1;
                    match merge_uplink_metadata(
                        &mut package,
                        metadata.document,
                        uplink.as_ref(),
                        metadata.etag,
                        fetched,
                    ) {
                        Ok(()) => {
                            found = true;
                            uplink_errors.push(None);
                        }
                        Err(err) => {
                            warn!(package = name, uplink = uplink.name(), error = %err, "rejected uplink metadata");
                            uplink_errors.push(Some(err));
                        }
                    }
                }
                UplinkResponse::Failed(err) => {
                    queried += 1;
                    debug!(package = name, uplink = uplink.name(), error = %err, "uplink request failed");
                    uplink_errors.push(Some(err));
                }
            }
        }

        if !found {
            let unavailable = uplink_errors
                .iter()
                .flatten()
                .any(|err| self.classifier.is_timeout(err));
            let error = if unavailable {
                DepotError::ServiceUnavailable(name.to_string())
            } else {
                DepotError::NotFound(name.to_string())
            };
            return Err(SyncFailure {
                error,
                uplink_errors,
            });
        }

        if queried == 0 {
            trace!(package = name, "no uplink queried, serving local copy");
            return Ok(SyncOutcome {
                package,
                queried,
                uplink_errors: Vec::new(),
            });
        }

        match self.storage.update_versions(name, package).await {
            Ok(stored) => {
                Ok(SyncOutcome {
                    package: stored,
                    queried,
                    uplink_errors,
                })
            }
            Err(err) => {
                Err(SyncFailure {
                    error: err.into(),
                    uplink_errors,
                })
            }
        }
    }
}

async fn query_uplink(
    uplink: &dyn Uplink,
    name: &str,
    cached: Option<&UplinkCacheEntry>,
    etag_hint: Option<&str>,
) -> UplinkResponse {
    let etag = match cached {
        Some(entry) => {
            if entry.is_fresh(uplink.max_age(), now_millis()) {
                trace!(package = name, uplink = uplink.name(), "cache entry is fresh");
                return UplinkResponse::Fresh;
            }
            entry.etag.clone()
        }
        None => etag_hint.map(String::from),
    };

    let result = uplink.get_remote_metadata(name, etag.as_deref()).await;
    let fetched = now_millis();

    match result {
        Ok(metadata) => {
            UplinkResponse::Data {
                metadata,
                fetched,
            }
        }
        Err(RegistryError::NotModified) => {
            UplinkResponse::NotModified {
                etag,
                fetched,
            }
        }
        Err(err) => UplinkResponse::Failed(err.into()),
    }
}
