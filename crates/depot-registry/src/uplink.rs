//! The uplink abstraction and the ordered set of configured uplinks.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use depot_config::config::Config;
use depot_utils::stream::{RecordStream, TarballReader};
use serde_json::Value;
use url::Url;

use crate::{
    error::{RegistryError, Result},
    http::HttpUplink,
    http_client::ClientConfig,
    metadata::RemoteMetadata,
};

/// Options for a search request.
#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    /// Skip uplinks and only search local packages.
    pub local_only: bool,

    /// Case-insensitive text a record must contain in its name, description
    /// or keywords.
    pub query: Option<String>,
}

impl SearchOptions {
    pub fn matches(&self, record: &Value) -> bool {
        let Some(query) = self.query.as_deref().filter(|q| !q.is_empty()) else {
            return true;
        };
        let query = query.to_lowercase();
        let contains = |field: &str| {
            record
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|text| text.to_lowercase().contains(&query))
        };

        contains("name")
            || contains("description")
            || record
                .get("keywords")
                .and_then(Value::as_array)
                .is_some_and(|keywords| {
                    keywords
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|k| k.to_lowercase().contains(&query))
                })
    }
}

/// An upstream registry.
#[async_trait]
pub trait Uplink: Send + Sync {
    fn name(&self) -> &str;

    fn url(&self) -> &Url;

    /// How long a fetched metadata document stays fresh.
    fn max_age(&self) -> Duration;

    /// Whether tarballs fetched through this uplink may be stored locally.
    fn cache_enabled(&self) -> bool;

    /// Uplinks created on the fly for a tarball URL no configured uplink
    /// serves.
    fn is_autogenerated(&self) -> bool {
        false
    }

    /// Whether `url` is served by this uplink.
    fn is_uplink_valid(&self, url: &str) -> bool {
        url_belongs_to(self.url(), url)
    }

    /// Fetches the metadata document of `name`, conditional on `etag`.
    ///
    /// Returns [`RegistryError::NotModified`] when the uplink confirms the
    /// cached copy is current.
    async fn get_remote_metadata(&self, name: &str, etag: Option<&str>) -> Result<RemoteMetadata>;

    /// Opens a tarball. The returned reader exists only once the remote
    /// source has been opened.
    async fn fetch_tarball(&self, url: &str) -> Result<TarballReader<RegistryError>>;

    /// Streams package summaries changed after `start_key` (epoch millis).
    async fn search(
        &self,
        start_key: u64,
        options: &SearchOptions,
    ) -> Result<RecordStream<RegistryError>>;
}

/// Whether `candidate` lives under `base`: same scheme, same host and port
/// (default ports normalized), and a path starting with the base path.
pub fn url_belongs_to(base: &Url, candidate: &str) -> bool {
    let Ok(candidate) = Url::parse(candidate) else {
        return false;
    };

    candidate.scheme() == base.scheme()
        && candidate.host_str() == base.host_str()
        && candidate.port_or_known_default() == base.port_or_known_default()
        && candidate.path().starts_with(base.path())
}

pub type AdHocFactory = Arc<dyn Fn(&Url) -> Arc<dyn Uplink> + Send + Sync>;

/// Configured uplinks in lookup order, plus a factory for ad-hoc uplinks.
#[derive(Clone)]
pub struct UplinkRegistry {
    uplinks: Vec<Arc<dyn Uplink>>,
    ad_hoc: AdHocFactory,
}

impl fmt::Debug for UplinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UplinkRegistry")
            .field("uplinks", &self.uplinks.iter().map(|u| u.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl UplinkRegistry {
    /// Builds a registry from explicit uplinks. Ad-hoc uplinks are plain
    /// HTTP uplinks with the default client configuration.
    pub fn new(uplinks: Vec<Arc<dyn Uplink>>) -> Self {
        let client = ClientConfig::default();
        Self {
            uplinks,
            ad_hoc: Arc::new(move |url: &Url| -> Arc<dyn Uplink> {
                Arc::new(HttpUplink::ad_hoc(url.clone(), &client))
            }),
        }
    }

    /// Builds HTTP uplinks for every enabled uplink in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = ClientConfig::from_config(config)?;

        let uplinks = config
            .enabled_uplinks()
            .map(|uplink| HttpUplink::new(uplink, &client).map(|u| Arc::new(u) as Arc<dyn Uplink>))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            uplinks,
            ad_hoc: Arc::new(move |url: &Url| -> Arc<dyn Uplink> {
                Arc::new(HttpUplink::ad_hoc(url.clone(), &client))
            }),
        })
    }

    pub fn with_ad_hoc<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Url) -> Arc<dyn Uplink> + Send + Sync + 'static,
    {
        self.ad_hoc = Arc::new(factory);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Uplink>> {
        self.uplinks.iter().find(|uplink| uplink.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Uplink>> {
        self.uplinks.iter()
    }

    pub fn len(&self) -> usize {
        self.uplinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uplinks.is_empty()
    }

    /// The first configured uplink serving `url`.
    pub fn find_for_url(&self, url: &str) -> Option<Arc<dyn Uplink>> {
        self.uplinks
            .iter()
            .find(|uplink| uplink.is_uplink_valid(url))
            .cloned()
    }

    /// Creates an uplink scoped to `url` for a tarball no configured uplink
    /// serves.
    pub fn ad_hoc(&self, url: &str) -> Result<Arc<dyn Uplink>> {
        let parsed = Url::parse(url).map_err(|err| RegistryError::InvalidUrl(format!("{url}: {err}")))?;
        Ok((self.ad_hoc)(&parsed))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_url_belongs_to() {
        let base = Url::parse("https://registry.example.com/npm/").unwrap();

        assert!(url_belongs_to(&base, "https://registry.example.com/npm/pkg/-/pkg-1.0.0.tgz"));
        assert!(url_belongs_to(&base, "https://registry.example.com:443/npm/pkg/-/pkg-1.0.0.tgz"));
        assert!(!url_belongs_to(&base, "http://registry.example.com/npm/pkg/-/pkg-1.0.0.tgz"));
        assert!(!url_belongs_to(&base, "https://registry.example.com:8443/npm/pkg.tgz"));
        assert!(!url_belongs_to(&base, "https://registry.example.com/other/pkg.tgz"));
        assert!(!url_belongs_to(&base, "https://cdn.example.com/npm/pkg.tgz"));
        assert!(!url_belongs_to(&base, "not a url"));
    }

    #[test]
    fn test_search_options_matches() {
        let record = json!({
            "name": "left-pad",
            "description": "String padding",
            "keywords": ["pad", "Strings"]
        });

        assert!(SearchOptions::default().matches(&record));
        let query = |q: &str| {
            SearchOptions {
                local_only: false,
                query: Some(q.into()),
            }
        };
        assert!(query("LEFT").matches(&record));
        assert!(query("padding").matches(&record));
        assert!(query("strings").matches(&record));
        assert!(!query("right").matches(&record));
    }

    #[test]
    fn test_registry_from_config_keeps_order() {
        let mut config = Config::default_config();
        config
            .uplinks
            .push(depot_config::uplink::UplinkConfig::new("mirror", "https://mirror.example/"));

        let registry = UplinkRegistry::from_config(&config).unwrap();
        let names: Vec<_> = registry.iter().map(|u| u.name().to_string()).collect();
        assert_eq!(names, vec!["npmjs", "mirror"]);
        assert!(registry.get("mirror").is_some());

        let found = registry
            .find_for_url("https://mirror.example/pkg/-/pkg-1.0.0.tgz")
            .unwrap();
        assert_eq!(found.name(), "mirror");
        assert!(registry.find_for_url("https://cdn.example/pkg.tgz").is_none());
    }

    #[test]
    fn test_ad_hoc_uplink() {
        let registry = UplinkRegistry::new(Vec::new());
        let uplink = registry
            .ad_hoc("https://cdn.example/pkg/-/pkg-1.0.0.tgz")
            .unwrap();

        assert!(uplink.is_autogenerated());
        assert!(uplink.cache_enabled());
        assert!(registry.ad_hoc("::not a url::").is_err());
    }
}
