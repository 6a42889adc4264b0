use std::{collections::BTreeMap, path::Path};

use depot_core::{DepotError, ErrorContext, GetPackageOptions, Result, StorageHandler};
use depot_registry::{package::tarball_filename, Package};
use depot_storage::{LocalStorage, TarballWriter};
use nu_ansi_term::Color::{Blue, Cyan, Green, LightRed, Yellow};
use serde_json::Value;
use tokio::{fs, io::AsyncReadExt};
use tracing::{debug, info, warn};

use crate::utils::{str_field, to_pretty_json, Colored};

pub async fn show_package(
    handler: &StorageHandler,
    name: String,
    offline: bool,
    keep_uplinks: bool,
    raw: bool,
) -> Result<()> {
    let options = GetPackageOptions {
        uplinks_look: offline.then_some(false),
        keep_uplink_data: keep_uplinks,
        ..GetPackageOptions::new(name)
    };
    let response = handler.get_package(&options).await?;

    for err in response.uplink_errors.iter().flatten() {
        warn!("uplink lookup failed: {err}");
    }

    let package = response.package;
    if raw {
        let document = package
            .to_value()
            .map_err(|err| DepotError::Internal(format!("serializing {}: {err}", package.name)))?;
        info!("{}", to_pretty_json(&document)?);
        return Ok(());
    }

    let latest = package.latest().unwrap_or_default();
    let description = package
        .extra
        .get("description")
        .and_then(Value::as_str)
        .or_else(|| package.latest_manifest().map(|m| str_field(m, "description")))
        .unwrap_or_default();

    info!(
        name = package.name,
        latest = latest,
        versions = package.versions.len(),
        "{}@{} | {} versions",
        Colored(Blue, &package.name),
        Colored(LightRed, latest),
        Colored(Cyan, package.versions.len())
    );
    if !description.is_empty() {
        info!("{description}");
    }
    for (tag, version) in &package.dist_tags {
        info!(tag = tag, version = version, "  {}: {}", Colored(Green, tag), version);
    }

    Ok(())
}

pub async fn list_local(handler: &StorageHandler) -> Result<()> {
    let manifests = handler.get_local_database().await?;

    for manifest in &manifests {
        let name = str_field(manifest, "name");
        let version = str_field(manifest, "version");
        info!(
            name = name,
            version = version,
            "{}@{} {}",
            Colored(Blue, name),
            Colored(LightRed, version),
            str_field(manifest, "description")
        );
    }

    info!("{} local packages", Colored(Cyan, manifests.len()));
    Ok(())
}

pub async fn publish_package(
    handler: &StorageHandler,
    manifest_path: &Path,
    tarball: Option<&Path>,
) -> Result<()> {
    let content = fs::read_to_string(manifest_path)
        .await
        .with_context(|| format!("reading {}", manifest_path.display()))?;
    let document: Value = serde_json::from_str(&content).map_err(|err| {
        DepotError::BadRequest(format!("{} is not valid JSON: {err}", manifest_path.display()))
    })?;
    let package = Package::from_value(document).map_err(|err| {
        DepotError::BadRequest(format!(
            "{} is not a package document: {err}",
            manifest_path.display()
        ))
    })?;
    let name = package.name.clone();
    let version = package.latest().map(String::from);

    handler.add_package(&name, package).await?;

    if let Some(path) = tarball {
        upload_tarball(handler, &name, path).await?;
    }

    info!(
        name = name,
        "Published {}{}",
        Colored(Blue, &name),
        version
            .map(|v| format!("@{}", Colored(LightRed, v)))
            .unwrap_or_default()
    );
    Ok(())
}

async fn upload_tarball(handler: &StorageHandler, name: &str, path: &Path) -> Result<()> {
    let filename = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| DepotError::BadRequest(format!("invalid tarball path {}", path.display())))?;

    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let length = file
        .metadata()
        .await
        .with_context(|| format!("reading metadata of {}", path.display()))?
        .len();

    let mut writer = handler.add_tarball(name, filename).await?;
    writer.set_content_length(length);

    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = match file.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                writer.abort().await?;
                return Err(DepotError::IoError {
                    action: format!("reading {}", path.display()),
                    source: err,
                });
            }
        };
        if let Err(err) = writer.write(buffer[..read].to_vec().into()).await {
            writer.abort().await?;
            return Err(err.into());
        }
    }

    let written = writer.done().await?;
    debug!(package = name, filename, bytes = written, "tarball uploaded");
    Ok(())
}

pub async fn set_tag(
    handler: &StorageHandler,
    name: &str,
    tag: String,
    version: Option<String>,
) -> Result<()> {
    let message = match &version {
        Some(version) => format!("{} -> {}@{}", Colored(Yellow, &tag), name, version),
        None => format!("{} removed from {}", Colored(Yellow, &tag), name),
    };
    handler
        .merge_tags(name, &BTreeMap::from([(tag, version)]))
        .await?;

    info!("{message}");
    Ok(())
}

/// Drops one version from the document, then its tarball.
pub async fn unpublish_version(handler: &StorageHandler, name: &str, version: &str) -> Result<()> {
    let mut package = handler.storage().get_package_metadata(name).await?;
    let Some(manifest) = package.versions.remove(version) else {
        return Err(DepotError::NotFound(format!("{name}@{version}")));
    };
    package.dist_tags.retain(|_, tagged| tagged != version);
    let revision = package.rev.clone();

    handler
        .change_package(name, package, Some(&revision))
        .await?;

    let filename = manifest
        .get("dist")
        .and_then(|dist| dist.get("tarball"))
        .and_then(Value::as_str)
        .and_then(tarball_filename);
    if let Some(filename) = filename {
        match handler.remove_tarball(name, &filename, None).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(package = name, filename, "no local tarball to remove");
            }
            Err(err) => return Err(err),
        }
    }

    info!("Unpublished {}@{}", Colored(Blue, name), Colored(LightRed, version));
    Ok(())
}

pub async fn remove_package(handler: &StorageHandler, name: &str) -> Result<()> {
    handler.remove_package(name).await?;
    info!("Removed {}", Colored(Blue, name));
    Ok(())
}
