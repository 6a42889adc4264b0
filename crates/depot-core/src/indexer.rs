use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use serde_json::Value;

/// Receives published packages and removals, e.g. to maintain a search index.
pub trait Indexer: Send + Sync {
    /// `manifest` is the latest version of a newly published package.
    fn add(&self, manifest: &Value);

    fn remove(&self, name: &str);
}

/// Indexer that drops everything.
pub struct NullIndexer;

impl Indexer for NullIndexer {
    fn add(&self, _manifest: &Value) {}

    fn remove(&self, _name: &str) {}
}

/// Keeps the latest manifest of every indexed package in memory.
#[derive(Default)]
pub struct MemoryIndexer {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Manifests whose name, description or keywords contain `text`,
    /// ignoring case.
    pub fn query(&self, text: &str) -> Vec<Value> {
        let needle = text.to_lowercase();
        let matches = |manifest: &Value| {
            let field = |key: &str| {
                manifest
                    .get(key)
                    .and_then(Value::as_str)
                    .is_some_and(|s| s.to_lowercase().contains(&needle))
            };
            field("name")
                || field("description")
                || manifest
                    .get("keywords")
                    .and_then(Value::as_array)
                    .is_some_and(|k| {
                        k.iter()
                            .filter_map(Value::as_str)
                            .any(|k| k.to_lowercase().contains(&needle))
                    })
        };

        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|manifest| matches(manifest))
            .cloned()
            .collect()
    }
}

impl Indexer for MemoryIndexer {
    fn add(&self, manifest: &Value) {
        let Some(name) = manifest.get("name").and_then(Value::as_str) else {
            return;
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), manifest.clone());
    }

    fn remove(&self, name: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}
