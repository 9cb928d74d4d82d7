//! Timestamp utilities
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microsecond precision,
//! `Z` suffix) so that lexical ordering in SQL matches chronological ordering.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

use crate::{Error, Result};

/// Current UTC timestamp, truncated to the stored (microsecond) precision
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Format a timestamp for database storage
pub fn to_db(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp previously written by [`to_db`]
pub fn from_db(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::InvalidInput(format!("Invalid timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_now_returns_recent_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01 00:00:00 UTC
        assert!(timestamp.timestamp() < 4_102_444_800); // 2100-01-01 00:00:00 UTC
    }

    #[test]
    fn test_db_format_is_fixed_width() {
        let a = to_db(now());
        let b = to_db(now() + Duration::hours(5));
        assert_eq!(a.len(), b.len());
        assert!(a.ends_with('Z'));
    }

    #[test]
    fn test_db_format_orders_lexically() {
        let earlier = now() - Duration::hours(30);
        let later = now() - Duration::hours(10);
        assert!(to_db(earlier) < to_db(later));
    }

    #[test]
    fn test_db_round_trip_keeps_microseconds() {
        let original = now();
        let parsed = from_db(&to_db(original)).unwrap();
        let diff = (original - parsed).num_microseconds().unwrap().abs();
        assert!(diff < 1, "round trip drifted by {} us", diff);
    }

    #[test]
    fn test_from_db_rejects_garbage() {
        assert!(matches!(from_db("yesterday"), Err(Error::InvalidInput(_))));
    }
}
