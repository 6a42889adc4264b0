use std::time::Duration;

use depot_utils::time::parse_duration;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// An upstream registry packages may be proxied from.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UplinkConfig {
    /// Unique name of the uplink, referenced by package rules.
    pub name: String,

    /// Base URL of the registry.
    pub url: String,

    /// How long fetched metadata stays fresh before the uplink is asked again.
    /// Default: "2m"
    pub maxage: Option<String>,

    /// Request timeout.
    /// Default: "30s"
    pub timeout: Option<String>,

    /// Whether tarballs fetched from this uplink are stored locally.
    /// Default: true
    pub cache: Option<bool>,

    /// Whether the uplink is used at all.
    /// Default: true
    pub enabled: Option<bool>,
}

impl UplinkConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            maxage: None,
            timeout: None,
            cache: None,
            enabled: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.unwrap_or(true)
    }

    pub fn max_age(&self) -> Duration {
        self.maxage
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_MAX_AGE)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}
