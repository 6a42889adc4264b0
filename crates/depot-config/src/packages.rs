use fast_glob::glob_match;
use serde::{Deserialize, Deserializer, Serialize};

/// Maps a package name pattern to the uplinks it may be proxied from.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PackageAccess {
    /// Glob matched against the full package name, e.g. `@*/*` or `**`.
    pub pattern: String,

    /// Uplink names, in order. Accepts a single name or a list.
    #[serde(default, deserialize_with = "one_or_many")]
    pub proxy: Vec<String>,
}

impl PackageAccess {
    pub fn new<I, S>(pattern: impl Into<String>, proxy: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pattern: pattern.into(),
            proxy: proxy.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        glob_match(&self.pattern, name)
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(name) => vec![name],
        OneOrMany::Many(names) => names,
    })
}

/// Ordered package access rules. The first rule whose pattern matches a
/// name decides which uplinks that package is proxied from.
#[derive(Clone, Debug, Default)]
pub struct PackageRules {
    rules: Vec<PackageAccess>,
}

impl PackageRules {
    pub fn new(rules: Vec<PackageAccess>) -> Self {
        Self {
            rules,
        }
    }

    /// Rules proxying every package to the given uplinks.
    pub fn proxy_all<I, S>(uplinks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(vec![PackageAccess::new("**", uplinks)])
    }

    pub fn matching(&self, name: &str) -> Option<&PackageAccess> {
        self.rules.iter().find(|rule| rule.matches(name))
    }

    pub fn has_proxy_to(&self, name: &str, uplink: &str) -> bool {
        self.matching(name)
            .is_some_and(|rule| rule.proxy.iter().any(|p| p == uplink))
    }
}
