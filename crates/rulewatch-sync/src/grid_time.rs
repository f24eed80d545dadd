//! Grid timestamp parsing and formatting.
//!
//! Records persist timestamps in the grid-native `%Y-%m-%dT%H:%M:%S` form
//! (UTC, no offset). Inputs are accepted in that form, with fractional
//! seconds, as RFC 3339, or in the RFC 1123 style the grid's REST API emits.

use crate::error::SyncError;
use chrono::{DateTime, NaiveDateTime};

/// Format used when persisting timestamps.
pub const GRID_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const ACCEPTED_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%a, %d %b %Y %H:%M:%S UTC",
];

/// Parse a grid timestamp into a naive UTC datetime.
pub fn parse_grid_time(raw: &str) -> Result<NaiveDateTime, SyncError> {
    let raw = raw.trim();
    for format in ACCEPTED_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(parsed);
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.naive_utc())
        .map_err(|_| SyncError::Timestamp(raw.to_string()))
}

/// Format a timestamp the way records persist it.
pub fn format_grid_time(time: &NaiveDateTime) -> String {
    time.format(GRID_TIME_FORMAT).to_string()
}

/// Seconds from `earlier` to `later`, negative if `later` precedes `earlier`.
pub fn seconds_between(earlier: &NaiveDateTime, later: &NaiveDateTime) -> f64 {
    let delta = *later - *earlier;
    delta.num_milliseconds() as f64 / 1000.0
}

/// Serde adapter for optional grid timestamps.
pub mod option {
    use super::{format_grid_time, parse_grid_time};
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as a grid timestamp string, or `null`.
    pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(time) => serializer.serialize_str(&format_grid_time(time)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize from any accepted grid timestamp string, or `null`.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| parse_grid_time(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
