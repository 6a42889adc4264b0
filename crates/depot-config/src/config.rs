use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use depot_utils::time::parse_duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::{
    error::{ConfigError, ErrorContext, Result},
    packages::{PackageAccess, PackageRules},
    uplink::UplinkConfig,
};

pub const DEFAULT_TIMEOUT_CODES: &[&str] = &["ETIMEDOUT", "ESOCKETTIMEDOUT", "ECONNRESET"];

/// Settings for publishing packages.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PublishConfig {
    /// Accept publishes while every uplink is unreachable.
    /// Default: false
    pub allow_offline: Option<bool>,
}

/// Application's configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Directory holding locally published packages and cached tarballs.
    /// Default: ./storage
    pub storage: Option<String>,

    /// User agent sent to uplinks.
    /// Default: depot/<version>
    pub user_agent: Option<String>,

    /// HTTP proxy used for every uplink request.
    pub http_proxy: Option<String>,

    /// Transport error codes that classify a failed lookup as "registry
    /// unavailable" instead of "not found".
    /// Default: ["ETIMEDOUT", "ESOCKETTIMEDOUT", "ECONNRESET"]
    pub timeout_codes: Option<Vec<String>>,

    pub publish: Option<PublishConfig>,

    /// Configured upstream registries, in lookup order.
    #[serde(default)]
    pub uplinks: Vec<UplinkConfig>,

    /// Package access rules, first match wins.
    #[serde(default)]
    pub packages: Vec<PackageAccess>,
}

/// Location of the configuration file: `$DEPOT_CONFIG`, else `./depot.toml`.
pub fn config_path() -> PathBuf {
    match std::env::var("DEPOT_CONFIG") {
        Ok(path_str) => PathBuf::from(path_str),
        Err(_) => PathBuf::from("depot.toml"),
    }
}

impl Config {
    pub fn default_config() -> Self {
        let npmjs = UplinkConfig::new("npmjs", "https://registry.npmjs.org/");

        Self {
            storage: Some("./storage".to_string()),
            user_agent: None,
            http_proxy: None,
            timeout_codes: None,
            publish: Some(PublishConfig {
                allow_offline: Some(false),
            }),
            packages: vec![
                PackageAccess::new("@*/*", [npmjs.name.clone()]),
                PackageAccess::new("**", [npmjs.name.clone()]),
            ],
            uplinks: vec![npmjs],
        }
    }

    /// Loads the configuration from [`config_path`], falling back to the
    /// default configuration when the file does not exist.
    pub fn new() -> Result<Self> {
        Self::load(&config_path())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file not found, using defaults");
                Self::default_config()
            }
            Err(err) => {
                return Err(ConfigError::IoError {
                    action: format!("reading config file {}", path.display()),
                    source: err,
                })
            }
        };

        config.resolve()?;

        Ok(config)
    }

    pub fn resolve(&mut self) -> Result<()> {
        let mut seen_uplinks = HashSet::new();

        for uplink in &mut self.uplinks {
            if uplink.name.trim().is_empty() {
                return Err(ConfigError::EmptyUplinkName);
            }
            if !seen_uplinks.insert(uplink.name.clone()) {
                return Err(ConfigError::DuplicateUplinkName(uplink.name.clone()));
            }

            match Url::parse(&uplink.url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                _ => {
                    return Err(ConfigError::InvalidUplinkUrl {
                        name: uplink.name.clone(),
                        url: uplink.url.clone(),
                    })
                }
            }

            check_duration(&format!("uplinks.{}.maxage", uplink.name), &uplink.maxage)?;
            check_duration(&format!("uplinks.{}.timeout", uplink.name), &uplink.timeout)?;

            uplink.enabled.get_or_insert(true);
            uplink.cache.get_or_insert(true);
        }

        for rule in &self.packages {
            for proxy in &rule.proxy {
                if !seen_uplinks.contains(proxy) {
                    return Err(ConfigError::UnknownUplink {
                        pattern: rule.pattern.clone(),
                        uplink: proxy.clone(),
                    });
                }
            }
        }

        self.publish.get_or_insert_with(PublishConfig::default);

        Ok(())
    }

    pub fn get_storage_path(&self) -> PathBuf {
        if let Ok(env_path) = std::env::var("DEPOT_STORAGE") {
            return PathBuf::from(env_path);
        }
        PathBuf::from(self.storage.as_deref().unwrap_or("./storage"))
    }

    pub fn get_uplink(&self, name: &str) -> Option<&UplinkConfig> {
        self.uplinks
            .iter()
            .find(|uplink| uplink.name == name && uplink.is_enabled())
    }

    /// Enabled uplinks, in configuration order.
    pub fn enabled_uplinks(&self) -> impl Iterator<Item = &UplinkConfig> {
        self.uplinks.iter().filter(|uplink| uplink.is_enabled())
    }

    pub fn package_rules(&self) -> PackageRules {
        PackageRules::new(self.packages.clone())
    }

    /// Enabled uplinks `name` is proxied to, in configuration order.
    pub fn proxies_for(&self, name: &str) -> Vec<&UplinkConfig> {
        let rules = self.package_rules();
        self.enabled_uplinks()
            .filter(|uplink| rules.has_proxy_to(name, &uplink.name))
            .collect()
    }

    pub fn allow_offline_publish(&self) -> bool {
        self.publish
            .as_ref()
            .and_then(|publish| publish.allow_offline)
            .unwrap_or(false)
    }

    pub fn timeout_codes(&self) -> Vec<String> {
        match &self.timeout_codes {
            Some(codes) => codes.clone(),
            None => DEFAULT_TIMEOUT_CODES.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("depot/{}", env!("CARGO_PKG_VERSION")))
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = self.to_toml()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        fs::write(path, serialized)
            .with_context(|| format!("writing config file {}", path.display()))?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

fn check_duration(field: &str, value: &Option<String>) -> Result<()> {
    match value {
        Some(value) if parse_duration(value).is_none() => {
            Err(ConfigError::InvalidDuration {
                field: field.to_string(),
                value: value.clone(),
            })
        }
        _ => Ok(()),
    }
}

pub fn generate_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(ConfigError::ConfigAlreadyExists(
            path.display().to_string(),
        ));
    }

    Config::default_config().save(path)?;
    info!(
        "Default configuration file generated at: {}",
        path.display()
    );
    Ok(())
}
