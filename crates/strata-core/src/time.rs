//! Millisecond timestamps, time-like parsing, and interval units.
//!
//! Every timestamp that crosses a public API is UTC epoch milliseconds.
//! Calendar arithmetic (month and year buckets) goes through `chrono`.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{StrataError, StrataResult};

/// UTC epoch milliseconds.
pub type Timestamp = i64;

pub const MINUTE_MS: i64 = 60_000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;
pub const WEEK_MS: i64 = 7 * DAY_MS;

static RELATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s+(minute|hour|day|week|month|year)s?\s+ago$").unwrap()
});

pub fn to_datetime(ts: Timestamp) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ts).unwrap_or_default()
}

pub fn to_timestamp(dt: DateTime<Utc>) -> Timestamp {
    dt.timestamp_millis()
}

/// Render a timestamp for log lines and error messages.
pub fn format_ts(ts: Timestamp) -> String {
    to_datetime(ts).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn midnight(date: NaiveDate) -> Option<Timestamp> {
    date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis())
}

/// Parse a time-like value relative to `now`.
///
/// Accepts dates (`2023-01-01`), datetimes (`2023-01-01 12:30[:00]`, RFC 3339),
/// raw epoch milliseconds, `now`/`today`/`yesterday`, and relative expressions
/// such as `3 days ago`.
pub fn parse_time(value: &str, now: Timestamp) -> StrataResult<Timestamp> {
    let trimmed = value.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let invalid = || StrataError::InvalidTime(value.to_string());

    match lowered.as_str() {
        "now" => return Ok(now),
        "today" => return Ok(IntervalUnit::Day.floor(now)),
        "yesterday" => return Ok(IntervalUnit::Day.floor(now) - DAY_MS),
        _ => {}
    }

    if let Some(caps) = RELATIVE_RE.captures(&lowered) {
        let amount: i64 = caps[1].parse().map_err(|_| invalid())?;
        let current = to_datetime(now);
        let shifted = match &caps[2] {
            "minute" => Some(now - amount * MINUTE_MS),
            "hour" => Some(now - amount * HOUR_MS),
            "day" => Some(now - amount * DAY_MS),
            "week" => Some(now - amount * WEEK_MS),
            "month" => u32::try_from(amount)
                .ok()
                .and_then(|m| current.checked_sub_months(Months::new(m)))
                .map(to_timestamp),
            "year" => u32::try_from(amount.saturating_mul(12))
                .ok()
                .and_then(|m| current.checked_sub_months(Months::new(m)))
                .map(to_timestamp),
            _ => None,
        };
        return shifted.ok_or_else(invalid);
    }

    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return trimmed.parse::<i64>().map_err(|_| invalid());
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return midnight(date).ok_or_else(invalid);
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    Err(invalid())
}

// ---------------------------------------------------------------------------
// Interval units
// ---------------------------------------------------------------------------

/// Granularity of the buckets a schedule produces, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalUnit {
    FiveMinute,
    QuarterHour,
    HalfHour,
    Hour,
    Day,
    Month,
    Year,
}

impl IntervalUnit {
    const COARSEST_FIRST: [IntervalUnit; 7] = [
        IntervalUnit::Year,
        IntervalUnit::Month,
        IntervalUnit::Day,
        IntervalUnit::Hour,
        IntervalUnit::HalfHour,
        IntervalUnit::QuarterHour,
        IntervalUnit::FiveMinute,
    ];

    /// Length in milliseconds for units that have a fixed length.
    pub fn fixed_millis(self) -> Option<i64> {
        match self {
            IntervalUnit::FiveMinute => Some(5 * MINUTE_MS),
            IntervalUnit::QuarterHour => Some(15 * MINUTE_MS),
            IntervalUnit::HalfHour => Some(30 * MINUTE_MS),
            IntervalUnit::Hour => Some(HOUR_MS),
            IntervalUnit::Day => Some(DAY_MS),
            IntervalUnit::Month | IntervalUnit::Year => None,
        }
    }

    /// Shortest possible length of one bucket.
    fn min_millis(self) -> i64 {
        match self {
            IntervalUnit::Month => 28 * DAY_MS,
            IntervalUnit::Year => 365 * DAY_MS,
            other => other.fixed_millis().unwrap_or(DAY_MS),
        }
    }

    /// Coarsest unit whose buckets fit inside the given gap between two
    /// consecutive schedule firings.
    pub fn from_gap(gap_ms: i64) -> Self {
        Self::COARSEST_FIRST
            .into_iter()
            .find(|unit| unit.min_millis() <= gap_ms)
            .unwrap_or(IntervalUnit::FiveMinute)
    }

    pub fn is_coarser_than(self, other: IntervalUnit) -> bool {
        self > other
    }

    /// Start of the bucket containing `ts`.
    pub fn floor(self, ts: Timestamp) -> Timestamp {
        if let Some(size) = self.fixed_millis() {
            return ts - ts.rem_euclid(size);
        }
        let dt = to_datetime(ts);
        let month = if self == IntervalUnit::Year { 1 } else { dt.month() };
        NaiveDate::from_ymd_opt(dt.year(), month, 1)
            .and_then(midnight)
            .unwrap_or(ts)
    }

    /// Smallest bucket boundary greater than or equal to `ts`.
    pub fn ceil(self, ts: Timestamp) -> Timestamp {
        let floor = self.floor(ts);
        if floor == ts {
            ts
        } else {
            self.next(floor)
        }
    }

    /// Boundary following the bucket that starts at (or contains) `ts`.
    pub fn next(self, ts: Timestamp) -> Timestamp {
        let start = self.floor(ts);
        if let Some(size) = self.fixed_millis() {
            return start.saturating_add(size);
        }
        let months = if self == IntervalUnit::Year { 12 } else { 1 };
        to_datetime(start)
            .checked_add_months(Months::new(months))
            .map(to_timestamp)
            .unwrap_or(Timestamp::MAX)
    }

    /// Boundary preceding the one at (or before) `ts`.
    pub fn prev(self, ts: Timestamp) -> Timestamp {
        let start = self.floor(ts);
        if let Some(size) = self.fixed_millis() {
            return start.saturating_sub(size);
        }
        let months = if self == IntervalUnit::Year { 12 } else { 1 };
        to_datetime(start)
            .checked_sub_months(Months::new(months))
            .map(to_timestamp)
            .unwrap_or(Timestamp::MIN)
    }

    /// Whole buckets inside `[start, end)`, oldest first.
    pub fn buckets(self, start: Timestamp, end: Timestamp) -> Vec<(Timestamp, Timestamp)> {
        let mut result = Vec::new();
        let mut current = self.ceil(start);
        while current < end {
            let next = self.next(current);
            if next > end {
                break;
            }
            result.push((current, next));
            current = next;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(value: &str) -> Timestamp {
        parse_time(value, 0).unwrap()
    }

    #[test]
    fn test_parse_dates_and_datetimes() {
        assert_eq!(ts("1970-01-02"), DAY_MS);
        assert_eq!(ts("1970-01-01 01:00:00"), HOUR_MS);
        assert_eq!(ts("1970-01-01 00:30"), 30 * MINUTE_MS);
        assert_eq!(ts("1970-01-01T00:01:00+00:00"), MINUTE_MS);
        assert_eq!(ts("86400000"), DAY_MS);
    }

    #[test]
    fn test_parse_relative_expressions() {
        let now = ts("2023-01-08 15:00:00");
        assert_eq!(parse_time("now", now).unwrap(), now);
        assert_eq!(parse_time("today", now).unwrap(), ts("2023-01-08"));
        assert_eq!(parse_time("yesterday", now).unwrap(), ts("2023-01-07"));
        assert_eq!(
            parse_time("2 days ago", now).unwrap(),
            ts("2023-01-06 15:00:00")
        );
        assert_eq!(
            parse_time("1 month ago", now).unwrap(),
            ts("2022-12-08 15:00:00")
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_time("next tuesday-ish", 0),
            Err(StrataError::InvalidTime(_))
        ));
        assert!(parse_time("", 0).is_err());
    }

    #[test]
    fn test_floor_and_ceil() {
        let t = ts("2023-03-15 10:17:00");
        assert_eq!(IntervalUnit::Day.floor(t), ts("2023-03-15"));
        assert_eq!(IntervalUnit::Day.ceil(t), ts("2023-03-16"));
        assert_eq!(IntervalUnit::Hour.floor(t), ts("2023-03-15 10:00:00"));
        assert_eq!(IntervalUnit::QuarterHour.floor(t), ts("2023-03-15 10:15:00"));
        assert_eq!(IntervalUnit::Month.floor(t), ts("2023-03-01"));
        assert_eq!(IntervalUnit::Year.floor(t), ts("2023-01-01"));
        assert_eq!(IntervalUnit::Day.ceil(ts("2023-03-15")), ts("2023-03-15"));
    }

    #[test]
    fn test_month_arithmetic_handles_varied_lengths() {
        assert_eq!(IntervalUnit::Month.next(ts("2023-01-31")), ts("2023-02-01"));
        assert_eq!(IntervalUnit::Month.next(ts("2023-02-01")), ts("2023-03-01"));
        assert_eq!(IntervalUnit::Month.prev(ts("2023-03-01")), ts("2023-02-01"));
        assert_eq!(IntervalUnit::Year.next(ts("2023-06-01")), ts("2024-01-01"));
    }

    #[test]
    fn test_buckets_only_whole_intervals() {
        let buckets = IntervalUnit::Day.buckets(ts("2023-01-01 06:00:00"), ts("2023-01-04 12:00:00"));
        assert_eq!(
            buckets,
            vec![
                (ts("2023-01-02"), ts("2023-01-03")),
                (ts("2023-01-03"), ts("2023-01-04")),
            ]
        );
        assert!(IntervalUnit::Day.buckets(ts("2023-01-02"), ts("2023-01-02")).is_empty());
    }

    #[test]
    fn test_unit_from_gap() {
        assert_eq!(IntervalUnit::from_gap(DAY_MS), IntervalUnit::Day);
        assert_eq!(IntervalUnit::from_gap(7 * DAY_MS), IntervalUnit::Day);
        assert_eq!(IntervalUnit::from_gap(28 * DAY_MS), IntervalUnit::Month);
        assert_eq!(IntervalUnit::from_gap(366 * DAY_MS), IntervalUnit::Year);
        assert_eq!(IntervalUnit::from_gap(HOUR_MS), IntervalUnit::Hour);
        assert_eq!(IntervalUnit::from_gap(MINUTE_MS), IntervalUnit::FiveMinute);
        assert!(IntervalUnit::Day.is_coarser_than(IntervalUnit::Hour));
    }
}
