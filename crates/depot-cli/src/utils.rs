use std::{
    fmt::Display,
    sync::{LazyLock, PoisonError, RwLock},
};

use depot_core::{DepotError, Result};
use nu_ansi_term::Color;
use serde_json::Value;

pub static COLOR: LazyLock<RwLock<bool>> = LazyLock::new(|| RwLock::new(true));

pub fn set_color(enabled: bool) {
    *COLOR.write().unwrap_or_else(PoisonError::into_inner) = enabled;
}

pub struct Colored<T: Display>(pub Color, pub T);

impl<T: Display> Display for Colored<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let color = *COLOR.read().unwrap_or_else(PoisonError::into_inner);
        if color {
            write!(f, "{}", self.0.prefix())?;
            self.1.fmt(f)?;
            write!(f, "{}", self.0.suffix())
        } else {
            self.1.fmt(f)
        }
    }
}

/// String field of a JSON document, empty when absent.
pub fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

pub fn to_pretty_json(value: &Value) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|err| DepotError::Internal(format!("serializing document: {err}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_str_field() {
        let value = json!({"name": "pkg", "version": 1});
        assert_eq!(str_field(&value, "name"), "pkg");
        assert_eq!(str_field(&value, "version"), "");
        assert_eq!(str_field(&value, "missing"), "");
    }
}
