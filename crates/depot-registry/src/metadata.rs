//! Structural validation of metadata documents received from uplinks.

use serde_json::{Map, Value};

use crate::{
    error::{RegistryError, Result},
    package::Package,
};

/// A metadata document as returned by an uplink.
#[derive(Clone, Debug)]
pub struct RemoteMetadata {
    pub document: Value,
    pub etag: Option<String>,
}

/// Validates an uplink document for package `name` and parses it.
///
/// The document must be a JSON object whose `name` equals `name` and which
/// carries a `versions` object. Missing or malformed `dist-tags` and `time`
/// are replaced by empty maps.
///
/// # Errors
///
/// Returns [`RegistryError::Validation`] when any of the checks fail.
pub fn validate_metadata(document: Value, name: &str) -> Result<Package> {
    let Value::Object(mut object) = document else {
        return Err(RegistryError::Validation("not a json object".into()));
    };

    match object.get("name").and_then(Value::as_str) {
        Some(actual) if actual == name => {}
        Some(actual) => {
            return Err(RegistryError::Validation(format!(
                "expected package `{name}`, got `{actual}`"
            )))
        }
        None => {
            return Err(RegistryError::Validation(
                "document has no `name`".into(),
            ))
        }
    }

    if !object.get("versions").is_some_and(Value::is_object) {
        return Err(RegistryError::Validation(format!(
            "`{name}` has no `versions` object"
        )));
    }

    for key in ["dist-tags", "time"] {
        if !object.get(key).is_some_and(Value::is_object) {
            object.insert(key.to_string(), Value::Object(Map::new()));
        }
    }

    Package::from_value(Value::Object(object))
        .map_err(|err| RegistryError::Validation(err.to_string()))
}
