//! Timestamp formatting shared by every table.
//!
//! All persisted timestamps are RFC 3339 UTC with fixed millisecond precision,
//! so string comparison in SQL matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Fractional days between `earlier` and `later`, never negative.
pub fn age_in_days(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let millis = (later - earlier).num_milliseconds().max(0) as f64;
    millis / 86_400_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn formatted_timestamps_sort_lexically() {
        let base = parse_ts("2026-01-01T10:00:00Z").unwrap();
        let a = format_ts(base + Duration::milliseconds(5));
        let b = format_ts(base + Duration::milliseconds(500));
        let c = format_ts(base + Duration::seconds(2));
        assert!(a < b && b < c);
        assert!(a.ends_with('Z'));
    }

    #[test]
    fn round_trips_through_parse() {
        let ts = parse_ts("2026-03-04T05:06:07.123Z").unwrap();
        assert_eq!(format_ts(ts), "2026-03-04T05:06:07.123Z");
        assert!(parse_ts("yesterday").is_none());
    }

    #[test]
    fn age_is_clamped_at_zero() {
        let t = now();
        assert_eq!(age_in_days(t, t - Duration::days(3)), 0.0);
        assert!((age_in_days(t - Duration::days(2), t) - 2.0).abs() < 1e-6);
    }
}
