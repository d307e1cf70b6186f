//! Cron schedule evaluation.
//!
//! Supports the standard five-field syntax (minute, hour, day-of-month,
//! month, day-of-week) with `*`, values, ranges, steps, comma lists, month and
//! weekday names, plus the `@daily`-style macros.

use std::fmt;

use chrono::{Datelike, NaiveDate, Timelike};

use crate::errors::{StrataError, StrataResult};
use crate::time::{to_datetime, IntervalUnit, Timestamp, MINUTE_MS};

/// Upper bound on search steps before a schedule is declared unsatisfiable.
const MAX_SEARCH_STEPS: usize = 500_000;

/// Firings sampled when inferring the bucket granularity of a schedule.
const UNIT_SAMPLE_SIZE: usize = 6;

/// 2020-01-01T00:00:00Z, the fixed origin for granularity sampling.
const UNIT_SAMPLE_ORIGIN: Timestamp = 1_577_836_800_000;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
    unit: IntervalUnit,
}

fn expand_macro(expression: &str) -> Option<&'static str> {
    match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

fn parse_value(raw: &str, min: u32, names: &[&str]) -> Result<u32, String> {
    if let Ok(value) = raw.parse::<u32>() {
        return Ok(value);
    }
    let upper = raw.to_ascii_uppercase();
    names
        .iter()
        .position(|name| *name == upper)
        .map(|idx| idx as u32 + min)
        .ok_or_else(|| format!("unrecognized value '{raw}'"))
}

/// Parse one field into a bitmask over `[min, max]`.
fn parse_field(field: &str, min: u32, max: u32, names: &[&str]) -> Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list entry in '{field}'"));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };
        let (low, high) = if range == "*" {
            (min, max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, min, names)?, parse_value(high, min, names)?)
        } else {
            let value = parse_value(range, min, names)?;
            (value, if step.is_some() { max } else { value })
        };
        if low < min || high > max || low > high {
            return Err(format!("'{part}' is outside {min}-{max}"));
        }
        let step = step.unwrap_or(1) as usize;
        for value in (low..=high).step_by(step) {
            mask |= 1u64 << value;
        }
    }
    Ok(mask)
}

fn has_bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

impl CronSchedule {
    pub fn parse(expression: &str) -> StrataResult<Self> {
        let invalid = |reason: String| StrataError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };
        let trimmed = expression.trim();
        let expanded = expand_macro(trimmed).unwrap_or(trimmed);
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let minutes = parse_field(fields[0], 0, 59, &[]).map_err(invalid)?;
        let hours = parse_field(fields[1], 0, 23, &[]).map_err(invalid)?;
        let days_of_month = parse_field(fields[2], 1, 31, &[]).map_err(invalid)?;
        let months = parse_field(fields[3], 1, 12, MONTH_NAMES).map_err(invalid)?;
        let mut days_of_week = parse_field(fields[4], 0, 7, WEEKDAY_NAMES).map_err(invalid)?;
        // 7 is an alias for Sunday.
        if has_bit(days_of_week, 7) {
            days_of_week = (days_of_week & !(1u64 << 7)) | 1;
        }

        let mut schedule = Self {
            expression: trimmed.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
            unit: IntervalUnit::Day,
        };
        schedule.unit = schedule.infer_unit()?;
        Ok(schedule)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Bucket granularity implied by the gaps between firings.
    pub fn interval_unit(&self) -> IntervalUnit {
        self.unit
    }

    fn infer_unit(&self) -> StrataResult<IntervalUnit> {
        let mut previous = self.next_after(UNIT_SAMPLE_ORIGIN)?;
        let mut smallest_gap = i64::MAX;
        for _ in 0..UNIT_SAMPLE_SIZE {
            let next = self.next_after(previous)?;
            smallest_gap = smallest_gap.min(next - previous);
            previous = next;
        }
        Ok(IntervalUnit::from_gap(smallest_gap))
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has_bit(self.days_of_month, date.day());
        let dow = has_bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn never_fires(&self) -> StrataError {
        StrataError::InvalidSchedule {
            expression: self.expression.clone(),
            reason: "schedule never fires".to_string(),
        }
    }

    /// First firing strictly after `ts`.
    pub fn next_after(&self, ts: Timestamp) -> StrataResult<Timestamp> {
        let mut current = ts - ts.rem_euclid(MINUTE_MS) + MINUTE_MS;
        for _ in 0..MAX_SEARCH_STEPS {
            let dt = to_datetime(current);
            if !has_bit(self.months, dt.month()) {
                current = IntervalUnit::Month.next(current);
            } else if !self.day_matches(dt.date_naive()) {
                current = IntervalUnit::Day.next(current);
            } else if !has_bit(self.hours, dt.hour()) {
                current = IntervalUnit::Hour.next(current);
            } else if !has_bit(self.minutes, dt.minute()) {
                current += MINUTE_MS;
            } else {
                return Ok(current);
            }
        }
        Err(self.never_fires())
    }

    /// Latest firing at or before `ts`.
    pub fn floor(&self, ts: Timestamp) -> StrataResult<Timestamp> {
        let mut current = ts - ts.rem_euclid(MINUTE_MS);
        for _ in 0..MAX_SEARCH_STEPS {
            let dt = to_datetime(current);
            if !has_bit(self.months, dt.month()) {
                current = IntervalUnit::Month.floor(current) - MINUTE_MS;
            } else if !self.day_matches(dt.date_naive()) {
                current = IntervalUnit::Day.floor(current) - MINUTE_MS;
            } else if !has_bit(self.hours, dt.hour()) {
                current = IntervalUnit::Hour.floor(current) - MINUTE_MS;
            } else if !has_bit(self.minutes, dt.minute()) {
                current -= MINUTE_MS;
            } else {
                return Ok(current);
            }
        }
        Err(self.never_fires())
    }

    /// End of the last bucket whose schedule has fully elapsed at `now`.
    pub fn eligible_end(&self, now: Timestamp) -> StrataResult<Timestamp> {
        Ok(self.unit.floor(self.floor(now)?))
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_time;

    fn ts(value: &str) -> Timestamp {
        parse_time(value, 0).unwrap()
    }

    #[test]
    fn test_macros_expand() {
        let daily = CronSchedule::parse("@daily").unwrap();
        assert_eq!(daily.interval_unit(), IntervalUnit::Day);
        assert_eq!(
            daily.next_after(ts("2023-01-01 10:00")).unwrap(),
            ts("2023-01-02")
        );
        assert_eq!(
            CronSchedule::parse("@hourly").unwrap().interval_unit(),
            IntervalUnit::Hour
        );
        assert_eq!(
            CronSchedule::parse("@monthly").unwrap().interval_unit(),
            IntervalUnit::Month
        );
        assert_eq!(
            CronSchedule::parse("@yearly").unwrap().interval_unit(),
            IntervalUnit::Year
        );
    }

    #[test]
    fn test_unit_inference_for_offset_schedules() {
        for expr in ["0 12 * * *", "50 23 * * *", "0 0 * * 1-5", "@weekly"] {
            assert_eq!(
                CronSchedule::parse(expr).unwrap().interval_unit(),
                IntervalUnit::Day,
                "{expr}"
            );
        }
        assert_eq!(
            CronSchedule::parse("*/15 * * * *").unwrap().interval_unit(),
            IntervalUnit::QuarterHour
        );
        assert_eq!(
            CronSchedule::parse("*/5 * * * *").unwrap().interval_unit(),
            IntervalUnit::FiveMinute
        );
    }

    #[test]
    fn test_floor_is_inclusive() {
        let cron = CronSchedule::parse("0 12 * * *").unwrap();
        assert_eq!(cron.floor(ts("2023-01-07 12:00")).unwrap(), ts("2023-01-07 12:00"));
        assert_eq!(cron.floor(ts("2023-01-08 00:10")).unwrap(), ts("2023-01-07 12:00"));
    }

    #[test]
    fn test_eligible_end_truncates_to_bucket() {
        let noon = CronSchedule::parse("0 12 * * *").unwrap();
        assert_eq!(noon.eligible_end(ts("2023-01-08 00:10")).unwrap(), ts("2023-01-07"));

        let late = CronSchedule::parse("50 23 * * *").unwrap();
        assert_eq!(late.eligible_end(ts("2023-01-08 00:00")).unwrap(), ts("2023-01-07"));
        assert_eq!(late.eligible_end(ts("2023-01-08 23:55")).unwrap(), ts("2023-01-08"));

        let daily = CronSchedule::parse("@daily").unwrap();
        assert_eq!(daily.eligible_end(ts("2023-01-08 15:00")).unwrap(), ts("2023-01-08"));
    }

    #[test]
    fn test_weekday_names_and_sunday_alias() {
        let by_name = CronSchedule::parse("0 0 * * SUN").unwrap();
        let by_seven = CronSchedule::parse("0 0 * * 7").unwrap();
        // 2023-01-08 is a Sunday.
        assert_eq!(by_name.next_after(ts("2023-01-03")).unwrap(), ts("2023-01-08"));
        assert_eq!(by_seven.next_after(ts("2023-01-03")).unwrap(), ts("2023-01-08"));
    }

    #[test]
    fn test_day_fields_either_match_when_both_restricted() {
        // Fires on the 1st of the month or on Mondays.
        let cron = CronSchedule::parse("0 0 1 * MON").unwrap();
        assert_eq!(cron.next_after(ts("2023-01-01")).unwrap(), ts("2023-01-02"));
        assert_eq!(cron.next_after(ts("2023-01-30")).unwrap(), ts("2023-02-01"));
    }

    #[test]
    fn test_ranges_steps_and_lists() {
        let cron = CronSchedule::parse("5,35 8-10/2 * JAN-MAR *").unwrap();
        assert_eq!(cron.next_after(ts("2023-01-01")).unwrap(), ts("2023-01-01 08:05"));
        assert_eq!(
            cron.next_after(ts("2023-01-01 08:05")).unwrap(),
            ts("2023-01-01 08:35")
        );
        assert_eq!(
            cron.next_after(ts("2023-01-01 08:35")).unwrap(),
            ts("2023-01-01 10:05")
        );
        assert_eq!(cron.next_after(ts("2023-03-31 10:35")).unwrap(), ts("2024-01-01 08:05"));
    }

    #[test]
    fn test_invalid_expressions() {
        for expr in ["", "* * *", "61 * * * *", "* * * * * *", "*/0 * * * *", "5-1 * * * *"] {
            assert!(
                matches!(CronSchedule::parse(expr), Err(StrataError::InvalidSchedule { .. })),
                "{expr}"
            );
        }
        assert!(CronSchedule::parse("0 0 30 2 *").is_err());
    }
}
