//! Provides parsing and formatting helpers for the durations used in cache configs.
//!
//! A cache's **live_time** is either a plain number of seconds or a number followed by one of the
//! common suffixes (`ms`, `s`, `m`, `h`, `d`). The special value `-1` (or an absent setting)
//! means that entries never expire.
use std::fmt::Write;
use std::time::Duration;

const UNITS: [(u128, &str); 5] = [
    (1000 * 60 * 60 * 24, "d"),
    (1000 * 60 * 60, "h"),
    (1000 * 60, "m"),
    (1000, "s"),
    (1, "ms"),
];

/// Parses a duration from a given string.
///
/// This string can have the following suffixes:
/// * **ms**: treats the value as milliseconds
/// * **s** (or no suffix at all): treats the value as seconds
/// * **m**: treats the value as minutes
/// * **h**: treats the value as hours
/// * **d**: treats the value as days
///
/// Suffixes can be given in lower or upper case. Returns an **Err** if either a non-integer value
/// is given, if an unknown suffix was provided or if the duration cannot be represented.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use invalidation_cache::fmt::parse_duration;
/// assert_eq!(parse_duration("100 ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(parse_duration("12").unwrap(), Duration::from_secs(12));
/// assert_eq!(parse_duration("3 M").unwrap(), Duration::from_secs(3 * 60));
/// assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(parse_duration("5 d").unwrap(), Duration::from_secs(5 * 24 * 60 * 60));
///
/// assert_eq!(parse_duration("3 Y").is_err(), true);
/// assert_eq!(parse_duration("1.2s").is_err(), true);
/// assert_eq!(parse_duration("-1m").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_SUFFIX: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *((ms|s|m|h|d|MS|S|M|H|D)?) *$").unwrap();
    }

    let invalid = || {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration. Expected a positive number and optionally \
             'ms', 's', 'm', 'h' or 'd' as suffix.",
            str.as_ref()
        )
    };

    let captures = NUMBER_AND_SUFFIX.captures(str.as_ref()).ok_or_else(invalid)?;
    let number = captures[1].parse::<u64>().map_err(|_| invalid())?;
    let seconds_per_unit = match &captures[2] {
        "ms" | "MS" => return Ok(Duration::from_millis(number)),
        "m" | "M" => 60,
        "h" | "H" => 60 * 60,
        "d" | "D" => 60 * 60 * 24,
        _ => 1,
    };

    number
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Parses the live time of a cache.
///
/// Yields **None** for `-1` which represents "never expire", otherwise behaves like
/// [parse_duration](parse_duration). Note that a live time of zero is valid and will make the
/// cache drop everything it is asked to store.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use invalidation_cache::fmt::parse_live_time;
/// assert_eq!(parse_live_time("-1").unwrap(), None);
/// assert_eq!(parse_live_time("0").unwrap(), Some(Duration::from_secs(0)));
/// assert_eq!(parse_live_time("15m").unwrap(), Some(Duration::from_secs(15 * 60)));
/// ```
pub fn parse_live_time(str: impl AsRef<str>) -> anyhow::Result<Option<Duration>> {
    if str.as_ref().trim() == "-1" {
        Ok(None)
    } else {
        parse_duration(str).map(Some)
    }
}

/// Formats a duration into a string like "5d 3h 17m 2s 12ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use invalidation_cache::fmt::format_duration;
/// assert_eq!(format_duration(Duration::from_millis(0)), "0ms");
/// assert_eq!(format_duration(Duration::from_millis(1013)), "1s 13ms");
/// assert_eq!(format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(format_duration(Duration::from_secs(24 * 60 * 60 + 59)), "1d 59s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let mut result = String::new();
    let mut value = duration.as_millis();

    for (millis, suffix) in UNITS {
        let amount = value / millis;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, suffix);
            value %= millis;
        }
    }

    if result.is_empty() {
        result.push_str("0ms");
    }

    result
}

/// Formats the live time of a cache, using "unlimited" for caches which never expire entries.
pub fn format_live_time(live_time: Option<Duration>) -> String {
    match live_time {
        Some(duration) => format_duration(duration),
        None => "unlimited".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use crate::fmt::{format_live_time, parse_duration, parse_live_time};
    use std::time::Duration;

    #[test]
    fn suffixes_are_case_insensitive() {
        assert_eq!(parse_duration("10MS").unwrap(), Duration::from_millis(10));
        assert_eq!(parse_duration(" 4 H ").unwrap(), Duration::from_secs(4 * 3600));
    }

    #[test]
    fn live_times_round_trip_through_the_formatter() {
        assert_eq!(format_live_time(parse_live_time("-1").unwrap()), "unlimited");
        assert_eq!(format_live_time(parse_live_time("90").unwrap()), "1m 30s");
        assert_eq!(parse_live_time("").is_err(), true);
        assert_eq!(parse_live_time("-2").is_err(), true);
    }

    #[test]
    fn oversized_durations_are_rejected() {
        assert_eq!(parse_live_time("300000000000000d").is_err(), true);
        assert_eq!(parse_duration("99999999999999999999999s").is_err(), true);
        assert_eq!(
            parse_duration("213503982334601d").unwrap(),
            Duration::from_secs(213_503_982_334_601 * 24 * 60 * 60)
        );
        assert_eq!(parse_duration("213503982334602d").is_err(), true);
    }
}
