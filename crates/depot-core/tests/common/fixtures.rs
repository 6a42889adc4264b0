use std::sync::Arc;

use depot_config::packages::PackageRules;
use depot_core::{HandlerSettings, Indexer, StorageHandler, UplinkSyncEngine};
use depot_registry::{Package, Uplink, UplinkRegistry};
use serde_json::{json, Value};

use super::mocks::{InstrumentedStorage, MockUplink};

/// Tarball URL a mock uplink serves for `name@version`.
pub fn tarball_url(uplink: &str, name: &str, version: &str) -> String {
    format!("https://{uplink}.example/{name}/-/{name}-{version}.tgz")
}

/// An uplink metadata document listing `versions`, the last one tagged
/// `latest`.
pub fn remote_document(uplink: &str, name: &str, versions: &[&str]) -> Value {
    let mut doc = json!({
        "name": name,
        "versions": {},
        "dist-tags": {},
        "time": {"modified": "2024-03-01T00:00:00.000Z"}
    });
    for version in versions {
        doc["versions"][*version] = json!({
            "name": name,
            "version": version,
            "description": format!("{name} from {uplink}"),
            "dist": {"tarball": tarball_url(uplink, name, version), "shasum": "0000"}
        });
        doc["time"][*version] = json!("2024-01-01T00:00:00.000Z");
    }
    if let Some(latest) = versions.last() {
        doc["dist-tags"]["latest"] = json!(latest);
    }
    doc
}

/// A locally published package with a single version.
pub fn local_package(name: &str, version: &str) -> Package {
    let mut package = Package::template(name);
    package.versions.insert(
        version.to_string(),
        json!({"name": name, "version": version, "description": "local"}),
    );
    package.dist_tags.insert("latest".into(), version.into());
    package
}

pub fn registry(uplinks: &[Arc<MockUplink>]) -> Arc<UplinkRegistry> {
    let uplinks: Vec<Arc<dyn Uplink>> = uplinks
        .iter()
        .map(|u| u.clone() as Arc<dyn Uplink>)
        .collect();
    Arc::new(UplinkRegistry::new(uplinks))
}

/// Every package proxied to every uplink.
pub fn rules(uplinks: &[Arc<MockUplink>]) -> PackageRules {
    PackageRules::proxy_all(uplinks.iter().map(|u| u.name().to_string()))
}

pub fn sync_engine(storage: Arc<InstrumentedStorage>, uplinks: &[Arc<MockUplink>]) -> UplinkSyncEngine {
    UplinkSyncEngine::new(
        registry(uplinks),
        rules(uplinks),
        storage,
        Default::default(),
    )
}

pub fn handler(
    storage: Arc<InstrumentedStorage>,
    uplinks: &[Arc<MockUplink>],
    indexer: Arc<dyn Indexer>,
    settings: HandlerSettings,
) -> StorageHandler {
    StorageHandler::new(storage, registry(uplinks), rules(uplinks), indexer, settings)
}
