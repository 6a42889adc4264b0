//! Semver helpers shared by the merge and storage layers.

use std::cmp::Ordering;

use semver::Version;

/// Parses a version string leniently: surrounding whitespace and a leading
/// `v` or `=` are ignored.
pub fn parse_version(input: &str) -> Option<Version> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('='))
        .unwrap_or(trimmed);
    Version::parse(trimmed).ok()
}

/// Sorts version strings ascending by semver precedence.
///
/// Strings that are not valid semver are dropped.
pub fn semver_sort<I, S>(versions: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed: Vec<(Version, String)> = versions
        .into_iter()
        .filter_map(|v| parse_version(v.as_ref()).map(|p| (p, v.as_ref().to_string())))
        .collect();
    parsed.sort_by(|a, b| a.0.cmp(&b.0));
    parsed.into_iter().map(|(_, raw)| raw).collect()
}

/// Returns the highest valid semver string, if any.
pub fn highest_version<I, S>(versions: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    semver_sort(versions).pop()
}

/// Returns `true` when `a <= b` by semver precedence.
///
/// An unparsable `a` always compares lower; an unparsable `b` never wins
/// over a parsable `a`.
pub fn version_lte(a: &str, b: &str) -> bool {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => a.cmp(&b) != Ordering::Greater,
        (None, _) => true,
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semver_sort() {
        let sorted = semver_sort(["1.10.0", "1.2.0", "not-a-version", "1.2.0-beta.1", "0.9.9"]);
        assert_eq!(sorted, vec!["0.9.9", "1.2.0-beta.1", "1.2.0", "1.10.0"]);
    }

    #[test]
    fn test_highest_version() {
        assert_eq!(
            highest_version(["2.0.0", "10.0.0", "3.1.4"]),
            Some("10.0.0".to_string())
        );
        assert_eq!(highest_version(Vec::<String>::new()), None);
        assert_eq!(highest_version(["garbage"]), None);
    }

    #[test]
    fn test_version_lte() {
        assert!(version_lte("1.0.0", "1.0.0"));
        assert!(version_lte("1.0.0", "1.0.1"));
        assert!(!version_lte("2.0.0", "1.9.9"));
        assert!(version_lte("junk", "1.0.0"));
        assert!(!version_lte("1.0.0", "junk"));
    }

    #[test]
    fn test_parse_version_lenient() {
        assert!(parse_version("v1.2.3").is_some());
        assert!(parse_version(" =1.2.3 ").is_some());
        assert!(parse_version("1.2").is_none());
    }
}
