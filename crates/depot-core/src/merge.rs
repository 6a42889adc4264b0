//! Folding uplink metadata into the local package document.

use depot_registry::{validate_metadata, Package, RegistryError, Uplink, UplinkCacheEntry};
use depot_utils::version::{highest_version, parse_version, version_lte};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{DepotError, Result};

/// Merges one uplink's metadata document into `local`.
///
/// The document is validated first; on failure `local` is left untouched.
/// Versions already known locally are never replaced, and their timestamps
/// are kept. Versions only the uplink knows are added, remembered as coming
/// from `uplink`, and get a dist file entry pointing at the uplink tarball.
pub fn merge_uplink_metadata(
    local: &mut Package,
    remote: Value,
    uplink: &dyn Uplink,
    etag: Option<String>,
    fetched: i64,
) -> Result<()> {
    let remote = validate_metadata(remote, &local.name).map_err(|err| {
        match err {
            RegistryError::Validation(msg) => DepotError::Validation(format!("{}: {msg}", uplink.name())),
            other => DepotError::Registry(other),
        }
    })?;

    local.uplinks.insert(
        uplink.name().to_string(),
        UplinkCacheEntry {
            etag,
            fetched,
        },
    );

    for (key, timestamp) in remote.time {
        let pinned = local.versions.contains_key(&key) && local.time.contains_key(&key);
        if !pinned {
            local.time.insert(key, timestamp);
        }
    }

    for (version, descriptor) in remote.versions {
        match local.versions.get(&version) {
            Some(existing) => {
                if existing != &descriptor {
                    debug!(
                        package = %local.name,
                        version = %version,
                        uplink = uplink.name(),
                        "keeping local copy of a version that differs upstream"
                    );
                }
            }
            None => {
                local.register_distfile(&descriptor, Some(uplink.name()), uplink.cache_enabled());
                local
                    .provenance
                    .insert(version.clone(), uplink.name().to_string());
                local.versions.insert(version, descriptor);
            }
        }
    }

    for (tag, version) in &remote.dist_tags {
        let current = local.dist_tags.get(tag);
        if current == Some(version) {
            continue;
        }

        if current.map_or(true, |current| version_lte(current, version)) {
            trace!(package = %local.name, tag = %tag, version = %version, "tag moved by uplink");
            local.dist_tags.insert(tag.clone(), version.clone());
        }

        if tag == "latest" && local.dist_tags.get(tag) == Some(version) {
            if let Some(readme) = &remote.readme {
                local.readme = Some(readme.clone());
            }
        }
    }

    Ok(())
}

/// Drops tags that do not name a valid version and points `latest` at the
/// highest known version when it is missing or dangling.
pub fn normalize_dist_tags(pkg: &mut Package) {
    pkg.dist_tags
        .retain(|_, version| parse_version(version).is_some());

    let dangling = pkg
        .latest()
        .map_or(true, |latest| !pkg.versions.contains_key(latest));
    if dangling {
        pkg.dist_tags.remove("latest");
        if let Some(highest) = highest_version(pkg.versions.keys()) {
            pkg.dist_tags.insert("latest".to_string(), highest);
        }
    }
}

/// Removes internal bookkeeping before a document is handed to clients.
/// Uplink freshness stamps survive only with `keep_uplink_data`.
pub fn clean_up_uplink_refs(pkg: &mut Package, keep_uplink_data: bool) {
    pkg.distfiles.clear();
    pkg.provenance.clear();
    pkg.extra.retain(|key, _| key == "users");
    if !keep_uplink_data {
        pkg.uplinks.clear();
    }
}
