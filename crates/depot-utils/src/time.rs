use std::time::Duration;

use chrono::{SecondsFormat, Utc};

/// Parses a human readable interval into a [`Duration`].
///
/// The input is a sequence of `<number><unit>` groups, optionally separated by
/// whitespace. Supported units are `ms`, `s`, `m`, `h`, `d` and `w`. A bare
/// number without unit is read as seconds.
///
/// # Arguments
/// * `input` - An interval such as `2m`, `1d 12h` or `90`.
///
/// # Returns
/// The parsed duration, or `None` if the input is malformed or overflows.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use depot_utils::time::parse_duration;
///
/// assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_duration("1h 30m"), Some(Duration::from_secs(5400)));
/// ```
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(secs) = input.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total: u128 = 0;
    let mut chars = input.chars().filter(|c| !c.is_whitespace()).peekable();

    while chars.peek().is_some() {
        let mut number_str = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                number_str.push(chars.next()?);
            } else {
                break;
            }
        }

        if number_str.is_empty() {
            return None;
        }

        let number: u128 = number_str.parse().ok()?;
        let multiplier: u128 = match chars.next()? {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            's' => 1000,
            'm' => 60 * 1000,
            'h' => 60 * 60 * 1000,
            'd' => 24 * 60 * 60 * 1000,
            'w' => 7 * 24 * 60 * 60 * 1000,
            _ => return None,
        };

        total = total.checked_add(number.checked_mul(multiplier)?)?;
    }

    u64::try_from(total).ok().map(Duration::from_millis)
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time as an RFC 3339 timestamp with millisecond precision, the
/// format registries use in a package `time` map.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
