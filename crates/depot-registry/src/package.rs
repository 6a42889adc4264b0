//! The package document as stored locally and served to clients.

use std::{collections::BTreeMap, time::Duration};

use depot_utils::version::highest_version;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// Freshness stamp for one uplink's copy of a package.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct UplinkCacheEntry {
    #[serde(default)]
    pub etag: Option<String>,

    /// Milliseconds since the unix epoch.
    #[serde(default)]
    pub fetched: i64,
}

impl UplinkCacheEntry {
    pub fn is_fresh(&self, max_age: Duration, now: i64) -> bool {
        self.fetched > 0 && now.saturating_sub(self.fetched) < max_age.as_millis() as i64
    }
}

/// Where a tarball of a proxied version can be fetched from.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DistFile {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,

    /// Name of the uplink that contributed the version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,

    /// Whether a fetched copy may be stored locally.
    #[serde(default = "default_true")]
    pub cache: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlexiTag {
    Version(String),
    Versions(Vec<String>),
    Other(Value),
}

/// Accepts legacy array-valued dist-tags, collapsing each array to its
/// highest version. Empty arrays and non-string values are dropped.
fn flexible_dist_tags<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, FlexiTag>>::deserialize(deserializer)?.unwrap_or_default();

    Ok(raw
        .into_iter()
        .filter_map(|(tag, value)| {
            match value {
                FlexiTag::Version(version) => Some((tag, version)),
                FlexiTag::Versions(versions) => highest_version(versions).map(|v| (tag, v)),
                FlexiTag::Other(_) => None,
            }
        })
        .collect())
}

/// A package document in the npm registry JSON shape.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Package {
    pub name: String,

    /// Version string to version descriptor.
    #[serde(default)]
    pub versions: Map<String, Value>,

    #[serde(rename = "dist-tags", default, deserialize_with = "flexible_dist_tags")]
    pub dist_tags: BTreeMap<String, String>,

    /// Version string (plus `created`/`modified`) to timestamp.
    #[serde(default)]
    pub time: Map<String, Value>,

    #[serde(rename = "_uplinks", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub uplinks: BTreeMap<String, UplinkCacheEntry>,

    #[serde(rename = "_distfiles", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub distfiles: BTreeMap<String, DistFile>,

    #[serde(rename = "_attachments", default)]
    pub attachments: Map<String, Value>,

    #[serde(rename = "_rev", default)]
    pub rev: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,

    /// Remaining top-level fields (`users`, `description`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    /// Version to the uplink it was merged from in the current process.
    #[serde(skip)]
    pub provenance: BTreeMap<String, String>,
}

impl Package {
    /// An empty package document.
    pub fn template(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn latest(&self) -> Option<&str> {
        self.dist_tags.get("latest").map(String::as_str)
    }

    /// The version descriptor `latest` points at, if it exists.
    pub fn latest_manifest(&self) -> Option<&Value> {
        self.latest().and_then(|latest| self.versions.get(latest))
    }

    pub fn has_version(&self, version: &str) -> bool {
        self.versions.contains_key(version)
    }

    /// Records where the tarball of `descriptor` lives, unless its filename
    /// is already known. Returns the filename when an entry was added.
    pub fn register_distfile(
        &mut self,
        descriptor: &Value,
        registry: Option<&str>,
        cache: bool,
    ) -> Option<String> {
        let dist = descriptor.get("dist")?;
        let url = dist.get("tarball").and_then(Value::as_str)?;
        let filename = tarball_filename(url)?;

        if self.distfiles.contains_key(&filename) {
            return None;
        }

        self.distfiles.insert(
            filename.clone(),
            DistFile {
                url: url.to_string(),
                sha: dist.get("shasum").and_then(Value::as_str).map(String::from),
                registry: registry.map(String::from),
                cache,
            },
        );
        Some(filename)
    }
}

/// The filename component of a tarball URL.
///
/// ```
/// use depot_registry::package::tarball_filename;
///
/// assert_eq!(
///     tarball_filename("https://registry.npmjs.org/@types/node/-/node-20.1.0.tgz"),
///     Some("node-20.1.0.tgz".to_string())
/// );
/// ```
pub fn tarball_filename(url: &str) -> Option<String> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };

    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(String::from)
}
