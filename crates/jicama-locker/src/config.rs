//! Configuration decoding helpers shared by locker implementations.
//!
//! Locker configs arrive as free-form JSON maps (one section per locker
//! under the collector's cluster config). Duration values are
//! human-readable strings such as "10s" or "500ms".

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::LockerError;

/// Decode a locker's raw config section into its typed config struct.
pub fn decode_config<T: DeserializeOwned>(cfg: serde_json::Value) -> Result<T, LockerError> {
    serde_json::from_value(cfg).map_err(|e| LockerError::Config(e.to_string()))
}

/// Parse a duration string (e.g., "500ms", "15s", "1m", "1h").
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (num_str, unit_ms) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1u64)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1000u64)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60_000u64)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3_600_000u64)
    } else {
        (s, 1000u64)
    };

    let num: u64 = num_str.trim().parse().ok()?;
    Some(Duration::from_millis(num * unit_ms))
}

/// Render a duration in the shortest unit the backend accepts.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

/// Serde helper for optional duration fields expressed as human strings.
/// Accepts "10s"-style strings, bare numbers (seconds), and null.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<serde_json::Value> = Option::deserialize(deserializer)?;
        match opt {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .map(|secs| Some(Duration::from_secs(secs)))
                .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {n}"))),
            Some(serde_json::Value::String(s)) => super::parse_duration(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: '{s}'"))),
            Some(other) => Err(serde::de::Error::custom(format!(
                "invalid duration: {other}"
            ))),
        }
    }

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&super::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }
}
