//! Date normalization helpers.
//!
//! Collectors report `updated_on` / `timestamp` as epoch seconds (often
//! fractional). Everything stored in an index is ISO-8601 in UTC, and
//! identity enrollment lookups take timezone-naive UTC datetimes.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// Convert fractional epoch seconds into a UTC datetime.
///
/// Returns `None` for non-finite or out-of-range values.
pub fn unixtime_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1_000_000_000.0).round() as u32;
    Utc.timestamp_opt(whole as i64, nanos.min(999_999_999)).single()
}

/// Convert fractional epoch seconds into an ISO-8601 string
/// (`2024-01-05T00:00:00+00:00`).
pub fn unixtime_to_iso(secs: f64) -> Option<String> {
    unixtime_to_datetime(secs).map(format_iso)
}

/// Format a UTC datetime the way stored documents carry it.
pub fn format_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// Parse the date formats found in raw and enriched documents.
///
/// Accepts RFC 3339 with offset, naive ISO datetimes (assumed UTC), a
/// space-separated datetime, or a bare `YYYY-MM-DD` date.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Strip the timezone from a datetime, keeping the UTC wall time.
pub fn to_naive_utc<Tz: TimeZone>(dt: &DateTime<Tz>) -> NaiveDateTime {
    dt.naive_utc()
}

/// Parse a date string straight into naive UTC.
pub fn parse_naive_utc(s: &str) -> Option<NaiveDateTime> {
    parse_datetime(s).map(|dt| dt.naive_utc())
}
