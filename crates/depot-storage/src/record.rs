//! Document-level operations shared by every storage backend.
//!
//! Backends own persistence; the rules for how a stored package changes live
//! here so both backends behave identically.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{TimeZone, Utc};
use depot_registry::Package;
use depot_utils::{
    time::{now_iso, now_millis},
    version::semver_sort,
};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{Result, StorageError};

static REVISION_SALT: AtomicU64 = AtomicU64::new(0);

/// Rejects names that could escape a storage root or are not valid
/// registry names.
pub fn validate_package_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(StorageError::BadRequest(format!(
            "invalid package name `{name}`: {reason}"
        )))
    };

    if name.is_empty() {
        return invalid("empty");
    }
    if name.contains('\\') || name.contains("..") || name.chars().any(char::is_control) {
        return invalid("forbidden characters");
    }

    let segments: Vec<&str> = name.split('/').collect();
    match segments.as_slice() {
        [single] if !single.starts_with('.') && !single.starts_with('@') => Ok(()),
        [scope, pkg]
            if scope.len() > 1 && scope.starts_with('@') && !pkg.is_empty() && !pkg.starts_with('.') =>
        {
            Ok(())
        }
        _ => invalid("expected `name` or `@scope/name`"),
    }
}

pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename.starts_with('.')
        || filename.contains('/')
        || filename.contains('\\')
        || filename == "package.json"
    {
        return Err(StorageError::BadRequest(format!(
            "invalid tarball filename `{filename}`"
        )));
    }
    Ok(())
}

/// Increments the numeric prefix of `_rev` and refreshes its suffix.
pub fn bump_revision(pkg: &mut Package) {
    let current = pkg
        .rev
        .split('-')
        .next()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    let salt = REVISION_SALT.fetch_add(1, Ordering::Relaxed);
    let suffix = (now_millis() as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ salt;
    pkg.rev = format!("{}-{suffix:016x}", current + 1);
}

/// Fails with `Conflict` when a revision is given and does not match.
pub fn check_revision(pkg: &Package, revision: Option<&str>) -> Result<()> {
    match revision {
        Some(rev) if !pkg.rev.is_empty() && rev != pkg.rev => {
            Err(StorageError::Conflict(format!(
                "revision {rev} of `{}` is outdated (current {})",
                pkg.name, pkg.rev
            )))
        }
        _ => Ok(()),
    }
}

/// Merges a synced package into the stored one. Returns whether anything
/// changed.
///
/// Missing versions are added without their per-version readme, their dist
/// files registered without overwriting existing ones. Tags and uplink
/// stamps from `incoming` win; `time` is replaced when it differs.
pub fn apply_update(local: &mut Package, incoming: &Package) -> bool {
    let mut changed = false;

    if incoming.readme.is_some() && incoming.readme != local.readme {
        local.readme = incoming.readme.clone();
        changed = true;
    }

    for (version, descriptor) in &incoming.versions {
        if local.versions.contains_key(version) {
            continue;
        }

        let mut descriptor = descriptor.clone();
        if let Some(object) = descriptor.as_object_mut() {
            object.remove("readme");
        }

        let provenance = incoming.provenance.get(version).map(String::as_str);
        let known = descriptor
            .get("dist")
            .and_then(|d| d.get("tarball"))
            .and_then(Value::as_str)
            .and_then(depot_registry::package::tarball_filename)
            .and_then(|filename| incoming.distfiles.get(&filename).map(|f| (filename, f.clone())));

        match known {
            Some((filename, file)) => {
                local.distfiles.entry(filename).or_insert(file);
            }
            None => {
                local.register_distfile(&descriptor, provenance, true);
            }
        }

        local.versions.insert(version.clone(), descriptor);
        changed = true;
    }

    for (tag, version) in &incoming.dist_tags {
        if local.dist_tags.get(tag) != Some(version) {
            local.dist_tags.insert(tag.clone(), version.clone());
            changed = true;
        }
    }

    for (uplink, entry) in &incoming.uplinks {
        if local.uplinks.get(uplink) != Some(entry) {
            local.uplinks.insert(uplink.clone(), entry.clone());
            changed = true;
        }
    }

    if !incoming.time.is_empty() && local.time != incoming.time {
        local.time = incoming.time.clone();
        changed = true;
    }

    changed
}

/// Adds a newly published version. The version's readme becomes the
/// package readme.
pub fn add_version(
    pkg: &mut Package,
    version: &str,
    mut metadata: Value,
    tag: Option<&str>,
) -> Result<()> {
    if pkg.versions.contains_key(version) {
        return Err(StorageError::Conflict(format!(
            "{}@{version} already exists",
            pkg.name
        )));
    }

    let Some(object) = metadata.as_object_mut() else {
        return Err(StorageError::BadRequest(format!(
            "metadata of {}@{version} is not an object",
            pkg.name
        )));
    };

    if let Some(readme) = object.remove("readme") {
        pkg.readme = readme.as_str().map(String::from);
    }

    let tarball = object
        .get("dist")
        .and_then(|d| d.get("tarball"))
        .and_then(Value::as_str)
        .and_then(depot_registry::package::tarball_filename);
    let shasum = object
        .get("dist")
        .and_then(|d| d.get("shasum"))
        .and_then(Value::as_str)
        .map(String::from);

    let attachment = match &tarball {
        Some(tarball) => pkg.attachments.get_mut(tarball),
        None => None,
    };
    if let Some(attachment) = attachment {
        let stored = attachment.get("shasum").and_then(Value::as_str);
        if let (Some(stored), Some(shasum)) = (stored, shasum.as_deref()) {
            if stored != shasum {
                return Err(StorageError::BadRequest(format!(
                    "shasum error, {stored} != {shasum}"
                )));
            }
        }
        if let Some(attachment) = attachment.as_object_mut() {
            attachment.insert("version".into(), Value::String(version.to_string()));
        }
    }

    let now = Value::String(now_iso());
    pkg.time.insert("modified".into(), now.clone());
    if !pkg.time.contains_key("created") {
        pkg.time.insert("created".into(), now.clone());
    }
    pkg.time.insert(version.to_string(), now);

    pkg.versions.insert(version.to_string(), metadata);
    if let Some(tag) = tag {
        pkg.dist_tags.insert(tag.to_string(), version.to_string());
    }

    Ok(())
}

pub fn merge_tags(pkg: &mut Package, tags: &BTreeMap<String, Option<String>>) -> Result<()> {
    for (tag, version) in tags {
        match version {
            None => {
                pkg.dist_tags.remove(tag);
            }
            Some(version) if pkg.versions.contains_key(version) => {
                pkg.dist_tags.insert(tag.clone(), version.clone());
            }
            Some(version) => {
                return Err(StorageError::NotFound(format!(
                    "{}@{version}",
                    pkg.name
                )));
            }
        }
    }
    Ok(())
}

/// Applies an edited document: versions it no longer lists are unpublished,
/// dist-tags and users are taken from it.
pub fn change_package(local: &mut Package, incoming: Package) {
    let removed: Vec<String> = local
        .versions
        .keys()
        .filter(|version| !incoming.versions.contains_key(*version))
        .cloned()
        .collect();

    for version in removed {
        info!(name = %local.name, version = %version, "unpublishing version");
        local.versions.remove(&version);
        local.time.remove(&version);
        for attachment in local.attachments.values_mut() {
            if let Some(object) = attachment.as_object_mut() {
                if object.get("version").and_then(Value::as_str) == Some(version.as_str()) {
                    object.remove("version");
                }
            }
        }
    }

    match incoming.extra.get("users") {
        Some(users) => {
            local.extra.insert("users".into(), users.clone());
        }
        None => {
            local.extra.remove("users");
        }
    }
    local.dist_tags = incoming.dist_tags;
}

pub fn record_attachment(pkg: &mut Package, filename: &str, size: u64) {
    pkg.attachments
        .insert(filename.to_string(), json!({ "size": size }));
}

pub fn remove_attachment(pkg: &mut Package, filename: &str) -> Result<()> {
    pkg.attachments
        .remove(filename)
        .map(|_| ())
        .ok_or_else(|| StorageError::NotFound(format!("{}/{filename}", pkg.name)))
}

/// The version `latest` names, or the highest known version.
pub fn latest_version(pkg: &Package) -> Option<String> {
    pkg.latest()
        .map(String::from)
        .or_else(|| semver_sort(pkg.versions.keys()).pop())
}

/// A search summary of `pkg`, as served by the `-/all` endpoint.
pub fn search_record(pkg: &Package, modified: i64) -> Option<Value> {
    let latest = latest_version(pkg)?;
    let version = pkg.versions.get(&latest)?;
    let field = |key: &str| version.get(key).cloned().unwrap_or(Value::Null);

    let maintainers = match version.get("maintainers") {
        Some(maintainers) => maintainers.clone(),
        None => {
            Value::Array(
                version
                    .get("author")
                    .filter(|a| !a.is_null())
                    .cloned()
                    .into_iter()
                    .collect(),
            )
        }
    };
    let modified = Utc
        .timestamp_millis_opt(modified)
        .single()
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));

    Some(json!({
        "name": field("name"),
        "description": field("description"),
        "dist-tags": { "latest": latest.clone() },
        "maintainers": maintainers,
        "author": field("author"),
        "repository": field("repository"),
        "readmeFilename": version.get("readmeFilename").cloned().unwrap_or_else(|| json!("")),
        "homepage": field("homepage"),
        "keywords": field("keywords"),
        "bugs": field("bugs"),
        "license": field("license"),
        "time": { "modified": modified },
        "versions": { latest: "latest" },
    }))
}
