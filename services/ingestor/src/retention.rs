//! Retention window: which records survive a trim.
//!
//! A record is in the window when `now - window < timestamp <= now`.
//! Timestamps are whatever the device sent, so parsing is lenient:
//!
//! - RFC 3339 (`2026-10-16T08:00:00Z`, `2026-10-16 08:00:00+02:00`)
//! - naive `YYYY-MM-DD HH:MM[:SS[.fff]]`, with a space or `T`, in local time
//! - `YYYY-MM-DD`, local midnight
//! - Unix epoch seconds, integer or fractional
//!
//! What happens to a record whose timestamp parses as none of these is a
//! policy choice (`keep_unparsable`).
//!
//! Sensor clocks drift.  `future_skew` widens the upper bound to
//! `now + future_skew` so a sensor running slightly ahead of this host does
//! not lose its freshest samples at every flush.  It defaults to zero, which
//! keeps the window exactly `(now - days, now]`.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub window: TimeDelta,
    pub keep_unparsable: bool,
    /// How far past `now` a timestamp may be and still count as fresh.
    pub future_skew: TimeDelta,
}

/// Outcome of checking one timestamp against the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    InWindow,
    OutOfWindow,
    UnparsableKept,
    UnparsableDropped,
}

impl Verdict {
    pub fn keeps(self) -> bool {
        matches!(self, Verdict::InWindow | Verdict::UnparsableKept)
    }
}

impl RetentionPolicy {
    pub fn days(days: u32, keep_unparsable: bool) -> Self {
        RetentionPolicy {
            window: TimeDelta::days(i64::from(days)),
            keep_unparsable,
            future_skew: TimeDelta::zero(),
        }
    }

    pub fn with_future_skew(mut self, skew: TimeDelta) -> Self {
        self.future_skew = skew;
        self
    }

    /// The exclusive lower bound of the window.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window
    }

    pub fn classify(&self, timestamp: &str, now: DateTime<Utc>) -> Verdict {
        match parse_timestamp(timestamp) {
            Some(ts) if ts > self.cutoff(now) && ts <= now + self.future_skew => Verdict::InWindow,
            Some(_) => Verdict::OutOfWindow,
            None if self.keep_unparsable => Verdict::UnparsableKept,
            None => Verdict::UnparsableDropped,
        }
    }
}

/// Parse a device timestamp; `None` if no supported form matches.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(secs) = raw.parse::<f64>() {
        return from_epoch_seconds(secs);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return local_to_utc(naive);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return local_to_utc(date.and_hms_opt(0, 0, 0)?);
    }
    None
}

fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    // Out-of-range values fail `from_timestamp` below.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    #[allow(clippy::cast_possible_truncation)]
    let whole = whole as i64;
    DateTime::from_timestamp(whole, nanos)
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
}
