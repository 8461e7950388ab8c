use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Storage format used by every timestamp column. Sorts lexicographically.
pub const STORAGE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Open-ended expiry as reported by the remote API.
pub const INFINITY: &str = "infinity";

/// Source of "now" for sync points.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_to_seconds(Utc::now())
    }
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(trimmed, STORAGE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y%m%d%H%M%S"))
        .with_context(|| format!("invalid timestamp {trimmed:?}"))?;
    Ok(naive.and_utc())
}

/// Rewrites a remote timestamp into the storage format.
pub fn normalize_timestamp(value: &str) -> Result<String> {
    parse_timestamp(value).map(format_timestamp)
}

/// Parses an expiry value, mapping "infinity" and friends to `None`.
pub fn parse_expiry(value: &str) -> Result<Option<DateTime<Utc>>> {
    match value.trim() {
        "" | INFINITY | "infinite" | "indefinite" | "never" => Ok(None),
        other => parse_timestamp(other).map(Some),
    }
}

/// Normalizes a remote expiry into its stored text form.
pub fn normalize_expiry(value: &str) -> Result<String> {
    Ok(match parse_expiry(value)? {
        Some(ts) => format_timestamp(ts),
        None => INFINITY.to_string(),
    })
}

pub fn truncate_to_seconds(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(value.timestamp(), 0).unwrap_or(value)
}

pub fn unix_now() -> Result<i64> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock error")?
        .as_secs();
    i64::try_from(secs).context("timestamp does not fit into i64")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn formats_in_storage_format() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).single().expect("valid");
        assert_eq!(format_timestamp(ts), "2024-03-09T07:05:01Z");
        assert_eq!(ts.format(STORAGE_FORMAT).to_string(), "2024-03-09T07:05:01Z");
    }

    #[test]
    fn parses_remote_and_compact_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).single().expect("valid");
        assert_eq!(parse_timestamp("2024-03-09T07:05:01Z").expect("iso"), expected);
        assert_eq!(parse_timestamp("20240309070501").expect("compact"), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn expiry_infinity_variants() {
        assert_eq!(parse_expiry("infinity").expect("parse"), None);
        assert_eq!(parse_expiry("indefinite").expect("parse"), None);
        assert_eq!(normalize_expiry("infinite").expect("parse"), INFINITY);
        assert_eq!(
            normalize_expiry("2030-01-01T00:00:00Z").expect("parse"),
            "2030-01-01T00:00:00Z"
        );
    }
}
