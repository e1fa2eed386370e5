//! Row-mapping helpers shared by the repositories.

use chrono::{DateTime, Utc};

use crate::domain::error::DatabaseError;

/// Parse an RFC 3339 timestamp column.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::SerializationError(format!("bad timestamp {s:?}: {e}")))
}

/// Parse an optional RFC 3339 timestamp column.
pub fn parse_datetime_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(parse_datetime).transpose()
}

/// Store a timestamp as RFC 3339.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_round_trip() {
        let now = Utc::now();
        let parsed = parse_datetime(&format_datetime(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_bad_timestamp_is_serialization_error() {
        assert!(matches!(
            parse_datetime("yesterday"),
            Err(DatabaseError::SerializationError(_))
        ));
    }
}
