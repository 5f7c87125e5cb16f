//! Timestamp utilities
//!
//! Timestamps are persisted as RFC 3339 text; calendar dates as `YYYY-MM-DD`.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert seconds (fractional allowed) to a duration
///
/// Negatives and NaN become zero; values past `Duration::MAX`, including
/// infinity, saturate to `Duration::MAX`.
pub fn secs_f64_to_duration(secs: f64) -> std::time::Duration {
    if secs.is_nan() || secs <= 0.0 {
        return std::time::Duration::ZERO;
    }
    std::time::Duration::try_from_secs_f64(secs).unwrap_or(std::time::Duration::MAX)
}

/// Format a timestamp for storage
pub fn to_db_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored timestamp
pub fn parse_db_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

/// Parse an optional stored timestamp
pub fn parse_optional_db_timestamp(
    column: &str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_db_timestamp(column, v)).transpose()
}

/// Format a calendar date for storage
pub fn to_db_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parse a stored calendar date
pub fn parse_db_date(column: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_returns_recent_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01 00:00:00 UTC
        assert!(timestamp.timestamp() < 4_102_444_800); // 2100-01-01 00:00:00 UTC
    }

    #[test]
    fn test_secs_f64_to_duration() {
        assert_eq!(secs_f64_to_duration(10.0), Duration::from_secs(10));
        assert_eq!(secs_f64_to_duration(0.25), Duration::from_millis(250));
        assert_eq!(secs_f64_to_duration(-1.0), Duration::ZERO);
        assert_eq!(secs_f64_to_duration(f64::NAN), Duration::ZERO);
    }

    #[test]
    fn test_secs_f64_to_duration_saturates() {
        assert_eq!(secs_f64_to_duration(1e30), Duration::MAX);
        assert_eq!(secs_f64_to_duration(f64::INFINITY), Duration::MAX);
        assert_eq!(secs_f64_to_duration(f64::NEG_INFINITY), Duration::ZERO);
    }

    #[test]
    fn test_timestamp_survives_storage_format() {
        let ts = now();
        let stored = to_db_timestamp(&ts);
        let parsed = parse_db_timestamp("started_at", &stored).unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn test_bad_timestamp_names_column() {
        let err = parse_db_timestamp("discovered_at", "yesterday").unwrap_err();
        assert!(err.to_string().contains("discovered_at"));
    }

    #[test]
    fn test_date_storage_format() {
        let date = NaiveDate::from_ymd_opt(2023, 4, 2).unwrap();
        assert_eq!(to_db_date(&date), "2023-04-02");
        assert_eq!(parse_db_date("session_date", "2023-04-02").unwrap(), date);
        assert!(parse_db_date("session_date", "04/02/2023").is_err());
    }
}
