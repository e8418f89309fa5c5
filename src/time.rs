use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fallback for timestamps that could not be read.
pub(crate) fn epoch() -> NaiveDateTime {
    DateTime::<Utc>::UNIX_EPOCH.naive_utc()
}

pub(crate) fn parse_date_time(raw: &str) -> std::result::Result<NaiveDateTime, chrono::ParseError> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|date_time| date_time.naive_utc()))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.fZ"))
}

/// Parses a timestamp field. Failures are logged with the raw value and
/// yield the Unix epoch, so the record can still be processed.
pub(crate) fn parse_date_time_or_default(raw: &str, field: &str) -> NaiveDateTime {
    parse_date_time(raw).unwrap_or_else(|_| {
        warn!(field, raw, "error parsing timestamp, using epoch");
        epoch()
    })
}

pub(crate) fn from_timestamp_millis_or_default(millis: Option<i64>, field: &str) -> NaiveDateTime {
    let Some(millis) = millis else {
        warn!(field, "missing timestamp, using epoch");
        return epoch();
    };
    match DateTime::from_timestamp_millis(millis) {
        Some(date_time) => date_time.naive_utc(),
        None => {
            warn!(field, millis, "timestamp out of range, using epoch");
            epoch()
        }
    }
}
