//! Five-field cron expressions, Vixie dialect
//!
//! `minute hour day-of-month month day-of-week`, evaluated in UTC at minute
//! resolution. Supports `*`, lists, ranges, steps, three-letter month and
//! weekday names, and the classic rule that a restricted day-of-month and a
//! restricted day-of-week combine with OR.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Upper bound on scan steps in `next_after`; generous for any satisfiable
/// expression (the worst case, Feb 29, needs about eight years of skips).
const MAX_SCAN_STEPS: usize = 100_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CronParseError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid value '{value}' in {field} field")]
    InvalidValue { field: &'static str, value: String },

    #[error("value {value} out of range {min}-{max} in {field} field")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid range '{0}': start exceeds end")]
    InvertedRange(String),

    #[error("invalid step '{0}'")]
    InvalidStep(String),
}

/// A parsed cron expression
///
/// Fields are bitmasks over their value domains, so matching a timestamp is
/// a handful of bit tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    expression: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl Schedule {
    /// Parse a five-field expression
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }

        let minutes = parse_field(fields[0], "minute", 0, 59, &[])?;
        let hours = parse_field(fields[1], "hour", 0, 23, &[])?;
        let days_of_month = parse_field(fields[2], "day-of-month", 1, 31, &[])?;
        let months = parse_field(fields[3], "month", 1, 12, &MONTH_NAMES)?;
        // 7 is an accepted alias for Sunday
        let raw_dow = parse_field(fields[4], "day-of-week", 0, 7, &DAY_NAMES)?;
        let days_of_week = ((raw_dow & 0x7f) | (raw_dow >> 7)) as u64;

        Ok(Self {
            expression: expression.to_string(),
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: days_of_week as u8,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    /// The source expression
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Does this schedule fire at `t`? Seconds are ignored.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute_matches(t.minute())
            && self.hour_matches(t.hour())
            && self.month_matches(t.month())
            && self.day_matches(t)
    }

    /// The first firing time strictly after `after`
    ///
    /// `None` only for unsatisfiable expressions such as `0 0 31 2 *`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        for _ in 0..MAX_SCAN_STEPS {
            if !self.month_matches(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_next_day(t)?;
                continue;
            }
            if !self.hour_matches(t.hour()) {
                t = (t + Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if !self.minute_matches(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn minute_matches(&self, minute: u32) -> bool {
        self.minutes & (1 << minute) != 0
    }

    fn hour_matches(&self, hour: u32) -> bool {
        self.hours & (1 << hour) != 0
    }

    fn month_matches(&self, month: u32) -> bool {
        self.months & (1 << (month - 1)) != 0
    }

    /// Vixie rule: when both day fields are restricted, either matching is
    /// enough; otherwise the restricted one (if any) decides.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month & (1 << (t.day() - 1)) != 0;
        let dow = self.days_of_week & (1 << t.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl FromStr for Schedule {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Parse one field into a bitmask with bit `v - min_offset` set for each
/// selected value. Month bits are shifted down so bit 0 is January.
fn parse_field(
    text: &str,
    field: &'static str,
    min: u32,
    max: u32,
    names: &[&str],
) -> Result<u64, CronParseError> {
    let mut mask: u64 = 0;
    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| CronParseError::InvalidStep(part.to_string()))?;
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo = parse_value(lo, field, min, max, names)?;
            let hi = parse_value(hi, field, min, max, names)?;
            if lo > hi {
                return Err(CronParseError::InvertedRange(part.to_string()));
            }
            (lo, hi)
        } else {
            let v = parse_value(range, field, min, max, names)?;
            // A bare value with a step means "from v to max", per Vixie
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };

        let mut v = start;
        while v <= end {
            mask |= 1 << (v - if min == 1 { 1 } else { 0 });
            v += step;
        }
    }
    Ok(mask)
}

fn parse_value(
    text: &str,
    field: &'static str,
    min: u32,
    max: u32,
    names: &[&str],
) -> Result<u32, CronParseError> {
    let lowered = text.to_ascii_lowercase();
    if let Some(idx) = names.iter().position(|n| *n == lowered) {
        // Named values are 1-based for months, 0-based for weekdays
        return Ok(idx as u32 + min.min(1));
    }
    let value: u32 = text.parse().map_err(|_| CronParseError::InvalidValue {
        field,
        value: text.to_string(),
    })?;
    if value < min || value > max {
        return Err(CronParseError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = t.date_naive().succ_opt()?;
    Utc.with_ymd_and_hms(next.year(), next.month(), next.day(), 0, 0, 0)
        .single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn every_minute() {
        let s = Schedule::parse("* * * * *").expect("parse");
        assert_eq!(
            s.next_after(at("2026-03-01T10:15:30Z")),
            Some(at("2026-03-01T10:16:00Z"))
        );
    }

    #[test]
    fn steps_and_lists() {
        let s = Schedule::parse("*/15 9-17 * * 1,3,5").expect("parse");
        // Sunday March 1 2026; next weekday hit is Monday March 2
        assert_eq!(
            s.next_after(at("2026-03-01T00:00:00Z")),
            Some(at("2026-03-02T09:00:00Z"))
        );
        assert!(s.matches(at("2026-03-02T09:45:00Z")));
        assert!(!s.matches(at("2026-03-02T08:45:00Z")));
        assert!(!s.matches(at("2026-03-03T09:45:00Z")));
    }

    #[test]
    fn named_months_and_days() {
        let s = Schedule::parse("0 0 * jan sun").expect("parse");
        assert!(s.matches(at("2026-01-04T00:00:00Z")));
        assert!(!s.matches(at("2026-02-01T00:00:00Z")));
    }

    #[test]
    fn sunday_as_seven() {
        let a = Schedule::parse("0 0 * * 0").expect("parse");
        let b = Schedule::parse("0 0 * * 7").expect("parse");
        let sunday = at("2026-03-01T00:00:00Z");
        assert!(a.matches(sunday));
        assert!(b.matches(sunday));
    }

    #[test]
    fn vixie_day_or_rule() {
        // Restricted dom AND restricted dow: either may match
        let s = Schedule::parse("0 0 15 * mon").expect("parse");
        assert!(s.matches(at("2026-03-15T00:00:00Z"))); // a Sunday, dom hit
        assert!(s.matches(at("2026-03-09T00:00:00Z"))); // a Monday, dow hit
        assert!(!s.matches(at("2026-03-10T00:00:00Z"))); // Tuesday the 10th

        // Only dow restricted: dom wildcard does not force a match
        let s = Schedule::parse("0 0 * * mon").expect("parse");
        assert!(!s.matches(at("2026-03-15T00:00:00Z")));
    }

    #[test]
    fn next_skips_months() {
        let s = Schedule::parse("30 6 1 12 *").expect("parse");
        assert_eq!(
            s.next_after(at("2026-03-01T10:00:00Z")),
            Some(at("2026-12-01T06:30:00Z"))
        );
    }

    #[test]
    fn leap_day() {
        let s = Schedule::parse("0 0 29 2 *").expect("parse");
        assert_eq!(
            s.next_after(at("2026-01-01T00:00:00Z")),
            Some(at("2028-02-29T00:00:00Z"))
        );
    }

    #[test]
    fn unsatisfiable_returns_none() {
        let s = Schedule::parse("0 0 31 2 *").expect("parse");
        assert_eq!(s.next_after(at("2026-01-01T00:00:00Z")), None);
    }

    #[test]
    fn rejects_malformed() {
        assert!(Schedule::parse("* * * *").is_err());
        assert!(Schedule::parse("60 * * * *").is_err());
        assert!(Schedule::parse("* 24 * * *").is_err());
        assert!(Schedule::parse("*/0 * * * *").is_err());
        assert!(Schedule::parse("5-2 * * * *").is_err());
        assert!(Schedule::parse("x * * * *").is_err());
        assert!(Schedule::parse("* * 0 * *").is_err());
    }

    #[test]
    fn roundtrips_expression_text() {
        let s: Schedule = "*/5 * * * *".parse().expect("parse");
        assert_eq!(s.to_string(), "*/5 * * * *");
    }
}
