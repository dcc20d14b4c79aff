//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.
//!
//! Each field accepts `*`, numbers, ranges `a-b`, lists `a,b` and steps
//! (`*/n`, `a-b/n`, `a/n`). Month and weekday fields also take three-letter
//! names. Day-of-week runs 0–7 with both 0 and 7 meaning Sunday. When both
//! day fields are restricted a time matches if either of them does.
//! The shorthands `@yearly`, `@monthly`, `@weekly`, `@daily` and `@hourly`
//! are expanded before parsing.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    #[error("{field}: invalid token '{token}'")]
    InvalidToken { field: &'static str, token: String },
    #[error("{field}: {value} is outside {min}-{max}")]
    OutOfRange { field: &'static str, value: u32, min: u32, max: u32 },
    #[error("{field}: step must be positive")]
    ZeroStep { field: &'static str },
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"],
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
};

/// A parsed cron schedule. Each field is a bit set of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let expanded = match expr.trim() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK)?;
        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: expr.trim().to_string(),
            minutes: parse_field(fields[0], &MINUTE)?,
            hours: parse_field(fields[1], &HOUR)?,
            days_of_month: parse_field(fields[2], &DAY_OF_MONTH)?,
            months: parse_field(fields[3], &MONTH)?,
            days_of_week,
            dom_restricted: !is_wildcard(fields[2]),
            dow_restricted: !is_wildcard(fields[4]),
        })
    }

    /// The expression as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the minute containing `t` is scheduled.
    pub fn matches(&self, t: &NaiveDateTime) -> bool {
        bit(self.minutes, t.minute())
            && bit(self.hours, t.hour())
            && self.matches_date(&t.date())
    }

    fn matches_date(&self, d: &NaiveDate) -> bool {
        if !bit(self.months, d.month()) {
            return false;
        }
        let dom = bit(self.days_of_month, d.day());
        let dow = bit(self.days_of_week, d.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First scheduled minute strictly after `after`, searching at most
    /// five years ahead.
    pub fn next_after(&self, after: &NaiveDateTime) -> Option<NaiveDateTime> {
        let start = after.date().and_time(NaiveTime::from_hms_opt(after.hour(), after.minute(), 0)?)
            + Duration::minutes(1);
        let mut day = start.date();
        let last_day = day + Duration::days(5 * 366);

        while day <= last_day {
            if self.matches_date(&day) {
                let (from_h, from_m) = if day == start.date() {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                for h in from_h..24 {
                    if !bit(self.hours, h) {
                        continue;
                    }
                    let first_minute = if h == from_h { from_m } else { 0 };
                    if let Some(m) = (first_minute..60).find(|&m| bit(self.minutes, m)) {
                        return day.and_hms_opt(h, m, 0);
                    }
                }
            }
            day = day.succ_opt()?;
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

fn bit(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

/// Any field starting with `*` (including `*/n`) leaves the day unrestricted.
fn is_wildcard(field: &str) -> bool {
    field.starts_with('*') || field == "?"
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<u64, CronError> {
    let mut set = 0u64;
    for part in field.split(',') {
        let invalid = || CronError::InvalidToken { field: spec.name, token: part.to_string() };

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(CronError::ZeroStep { field: spec.name });
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" || range == "?" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let v = parse_value(range, spec)?;
            // `a/n` runs from `a` to the end of the field.
            (v, if step.is_some() { spec.max } else { v })
        };

        if lo > hi {
            return Err(invalid());
        }
        let step = step.unwrap_or(1);
        let mut v = lo;
        while v <= hi {
            set |= 1u64 << v;
            v += step;
        }
    }
    Ok(set)
}

fn parse_value(token: &str, spec: &FieldSpec) -> Result<u32, CronError> {
    let lower = token.to_ascii_lowercase();
    let value = match spec.names.iter().position(|n| *n == lower) {
        // Month names start at 1, weekday names at 0.
        Some(i) => i as u32 + spec.min,
        None => token
            .parse::<u32>()
            .map_err(|_| CronError::InvalidToken { field: spec.name, token: token.to_string() })?,
    };
    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange { field: spec.name, value, min: spec.min, max: spec.max });
    }
    Ok(value)
}
