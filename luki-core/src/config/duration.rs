//! Duration fields in configuration files.
//!
//! Durations are written in humantime form: `30s`, `2m`, `1h 30m`, `250ms`.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Parse a duration string.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s.trim())
        .map_err(|e| format!("invalid duration '{s}': {e} (expected e.g. 30s, 2m, 250ms)"))
}

/// Deserialize a duration from a humantime string.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional duration from a humantime string.
pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    match opt {
        Some(s) => parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
    }

    #[test]
    fn test_deserialize_field() {
        #[derive(Debug, Deserialize)]
        struct Holder {
            #[serde(deserialize_with = "deserialize")]
            timeout: Duration,
            #[serde(default, deserialize_with = "deserialize_option")]
            cooldown: Option<Duration>,
        }

        let parsed: Holder = serde_saphyr::from_str("timeout: 45s\n").unwrap();
        assert_eq!(parsed.timeout, Duration::from_secs(45));
        assert_eq!(parsed.cooldown, None);

        let parsed: Holder = serde_saphyr::from_str("timeout: 1s\ncooldown: 5m\n").unwrap();
        assert_eq!(parsed.cooldown, Some(Duration::from_secs(300)));
    }
}
