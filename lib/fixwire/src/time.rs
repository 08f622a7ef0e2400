use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::time::SystemTime;

const FIX_TIMESTAMP_MILLIS: &str = "%Y%m%d-%H:%M:%S%.3f";
const FIX_TIMESTAMP_SECS: &str = "%Y%m%d-%H:%M:%S";

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Formats a timestamp as a FIX UTCTimestamp with millisecond precision,
/// e.g. `20260801-12:30:05.123`.
#[inline]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(FIX_TIMESTAMP_MILLIS).to_string()
}

/// The current time in FIX UTCTimestamp format.
#[inline]
pub fn utc_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Parses a FIX UTCTimestamp, with or without the millisecond part.
pub fn parse_timestamp(raw: &[u8]) -> Option<DateTime<Utc>> {
    let text = std::str::from_utf8(raw).ok()?;
    let naive = NaiveDateTime::parse_from_str(text, FIX_TIMESTAMP_MILLIS)
        .or_else(|_| NaiveDateTime::parse_from_str(text, FIX_TIMESTAMP_SECS))
        .ok()?;
    Some(Utc.from_utc_datetime(&naive))
}
