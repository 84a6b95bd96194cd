//! Savepoint timestamps.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;

const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9f";

/// Issues strictly increasing nanosecond timestamps.
///
/// Timestamps are fixed-width UTC strings, so lexical order equals time order.
#[derive(Debug, Default)]
pub struct SavepointClock {
    last: Mutex<i64>,
}

impl SavepointClock {
    /// Creates a clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a timestamp later than every one issued before.
    pub fn next(&self) -> String {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = self.last.lock();
        let next = if now > *last { now } else { *last + 1 };
        *last = next;
        format_nanos(next)
    }

    /// Formats nanoseconds since the epoch.
    pub fn format(nanos: i64) -> String {
        format_nanos(nanos)
    }

    /// Parses a timestamp back into nanoseconds since the epoch.
    pub fn parse(timestamp: &str) -> Option<i64> {
        NaiveDateTime::parse_from_str(timestamp, FORMAT)
            .ok()
            .and_then(|dt| dt.and_utc().timestamp_nanos_opt())
    }
}

fn format_nanos(nanos: i64) -> String {
    let secs = nanos.div_euclid(1_000_000_000);
    let subsec = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, subsec)
        .map(|dt| dt.format(FORMAT).to_string())
        .unwrap_or_default()
}
