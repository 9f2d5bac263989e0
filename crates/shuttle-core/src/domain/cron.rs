//! Five-field cron expressions (`MIN HOUR DOM MON DOW`), evaluated in UTC.
//!
//! Supported syntax per field: `*`, `*/n`, `a`, `a-b`, `a-b/n`, and comma
//! separated lists of those. Day-of-week accepts 0-7 (0 and 7 are Sunday).
//! When both day-of-month and day-of-week are restricted, a day matches if
//! either matches (classic cron semantics).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields (MIN HOUR DOM MON DOW), got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    /// Field started with `*` (matters for the DOM/DOW rule).
    any: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7 };

/// Upper bound for `next_after`; expressions like `0 0 30 2 *` never match.
const SEARCH_LIMIT_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [min, hour, dom, mon, dow] = fields.as_slice() else {
            return Err(CronError::FieldCount(fields.len()));
        };

        let mut days_of_week = parse_field(dow, DAY_OF_WEEK)?;
        // 7 is an alias for Sunday.
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(min, MINUTE)?,
            hours: parse_field(hour, HOUR)?,
            days_of_month: parse_field(dom, DAY_OF_MONTH)?,
            months: parse_field(mon, MONTH)?,
            days_of_week,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Does the expression match this whole minute?
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.matches_date(t.date_naive())
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        // Either field starting with `*` makes both required, otherwise
        // one is enough (vixie cron).
        if self.days_of_month.any || self.days_of_week.any {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// First matching minute strictly after `after`.
    ///
    /// Returns None if nothing matches within five years.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?
            .checked_add_signed(TimeDelta::minutes(1))?;

        let first_day = start.date_naive();
        for offset in 0..=SEARCH_LIMIT_DAYS {
            let date = first_day.checked_add_signed(TimeDelta::days(offset))?;
            if !self.matches_date(date) {
                continue;
            }
            let from = if offset == 0 {
                start.time()
            } else {
                NaiveTime::MIN
            };
            if let Some(time) = self.first_time_from(from) {
                return Some(date.and_time(time).and_utc());
            }
        }
        None
    }

    /// Earliest matching (hour, minute) at or after `from` within one day.
    fn first_time_from(&self, from: NaiveTime) -> Option<NaiveTime> {
        for hour in from.hour()..24 {
            if !self.hours.contains(hour) {
                continue;
            }
            let first_minute = if hour == from.hour() { from.minute() } else { 0 };
            if let Some(minute) = (first_minute..60).find(|m| self.minutes.contains(*m)) {
                return NaiveTime::from_hms_opt(hour, minute, 0);
            }
        }
        None
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_field(raw: &str, spec: FieldSpec) -> Result<FieldSet, CronError> {
    let invalid = |reason: String| CronError::InvalidField {
        field: spec.name,
        value: raw.to_string(),
        reason,
    };

    let mut bits = 0u64;
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("step '{step}' is not a number")))?;
                if step == 0 {
                    return Err(invalid("step must be at least 1".to_string()));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(lo, spec, &invalid)?, parse_value(hi, spec, &invalid)?)
        } else {
            let value = parse_value(range, spec, &invalid)?;
            // `a/n` means "from a to the end of the range every n".
            let hi = if step > 1 { spec.max } else { value };
            (value, hi)
        };
        if lo > hi {
            return Err(invalid(format!("range {lo}-{hi} is reversed")));
        }

        for value in (lo..=hi).step_by(step as usize) {
            bits |= 1 << value;
        }
    }

    Ok(FieldSet {
        bits,
        any: raw.starts_with('*'),
    })
}

fn parse_value(
    raw: &str,
    spec: FieldSpec,
    invalid: &dyn Fn(String) -> CronError,
) -> Result<u32, CronError> {
    let value: u32 = raw
        .parse()
        .map_err(|_| invalid(format!("'{raw}' is not a number")))?;
    if value < spec.min || value > spec.max {
        return Err(invalid(format!(
            "{value} is outside {}-{}",
            spec.min, spec.max
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[rstest]
    #[case("* * * * *", at(2026, 3, 1, 12, 0), at(2026, 3, 1, 12, 1))]
    #[case("*/15 * * * *", at(2026, 3, 1, 12, 7), at(2026, 3, 1, 12, 15))]
    #[case("0 * * * *", at(2026, 3, 1, 12, 0), at(2026, 3, 1, 13, 0))]
    #[case("30 2 * * *", at(2026, 3, 1, 3, 0), at(2026, 3, 2, 2, 30))]
    #[case("0 9 1 * *", at(2026, 3, 1, 9, 0), at(2026, 4, 1, 9, 0))]
    #[case("0 0 * * 1", at(2026, 3, 1, 0, 0), at(2026, 3, 2, 0, 0))] // 2026-03-02 is a Monday
    #[case("0 0 * * 7", at(2026, 3, 2, 0, 0), at(2026, 3, 8, 0, 0))] // 7 = Sunday
    #[case("0 0 29 2 *", at(2026, 3, 1, 0, 0), at(2028, 2, 29, 0, 0))]
    #[case("0 12 * * 1-5", at(2026, 3, 6, 12, 0), at(2026, 3, 9, 12, 0))]
    #[case("5,10 8-9/1 * * *", at(2026, 3, 1, 8, 7), at(2026, 3, 1, 8, 10))]
    fn next_after_finds_the_following_match(
        #[case] expr: &str,
        #[case] after: DateTime<Utc>,
        #[case] expected: DateTime<Utc>,
    ) {
        let cron = CronExpr::parse(expr).unwrap();
        assert_eq!(cron.next_after(after), Some(expected));
    }

    #[test]
    fn next_after_ignores_seconds() {
        let cron = CronExpr::parse("* * * * *").unwrap();
        let t = at(2026, 3, 1, 12, 0) + TimeDelta::seconds(42);
        assert_eq!(cron.next_after(t), Some(at(2026, 3, 1, 12, 1)));
    }

    #[test]
    fn day_of_month_or_day_of_week_when_both_restricted() {
        // The 15th, or any Friday.
        let cron = CronExpr::parse("0 0 15 * 5").unwrap();
        assert!(cron.matches(at(2026, 3, 15, 0, 0))); // Sunday the 15th
        assert!(cron.matches(at(2026, 3, 6, 0, 0))); // Friday
        assert!(!cron.matches(at(2026, 3, 7, 0, 0)));
    }

    #[test]
    fn stepped_star_day_field_is_intersected() {
        // Odd days that are also Mondays.
        let cron = CronExpr::parse("0 0 */2 * 1").unwrap();
        assert!(cron.matches(at(2026, 3, 9, 0, 0)));
        assert!(!cron.matches(at(2026, 3, 2, 0, 0))); // even Monday
        assert!(!cron.matches(at(2026, 3, 3, 0, 0))); // odd Tuesday
        assert_eq!(cron.next_after(at(2026, 3, 1, 0, 0)), Some(at(2026, 3, 9, 0, 0)));
    }

    #[test]
    fn impossible_date_yields_none() {
        let cron = CronExpr::parse("0 0 31 2 *").unwrap();
        assert_eq!(cron.next_after(at(2026, 1, 1, 0, 0)), None);
    }

    #[rstest]
    #[case("* * * *", CronError::FieldCount(4))]
    #[case("60 * * * *", CronError::InvalidField { field: "minute", value: "60".into(), reason: "60 is outside 0-59".into() })]
    #[case("* * 0 * *", CronError::InvalidField { field: "day-of-month", value: "0".into(), reason: "0 is outside 1-31".into() })]
    #[case("*/0 * * * *", CronError::InvalidField { field: "minute", value: "*/0".into(), reason: "step must be at least 1".into() })]
    #[case("* 5-2 * * *", CronError::InvalidField { field: "hour", value: "5-2".into(), reason: "range 5-2 is reversed".into() })]
    fn invalid_expressions_are_rejected(#[case] expr: &str, #[case] expected: CronError) {
        assert_eq!(CronExpr::parse(expr), Err(expected));
    }

    #[test]
    fn display_normalizes_whitespace() {
        let cron: CronExpr = "0   9 * *  1".parse().unwrap();
        assert_eq!(cron.to_string(), "0 9 * * 1");
    }
}
