//! # Cron Schedules
//!
//! Five-field cron expressions (minute, hour, day-of-month, month, day-of-week)
//! parsed into a validated [`CronSchedule`]. The same parsed value is used for
//! save-time validation and for computing the next fire time, so the two can
//! never disagree.
//!
//! Supported syntax per field: `*`, single values, `a-b` ranges, `/n` steps on
//! `*`, ranges or a start value, and comma-separated lists. Months accept
//! `JAN`..`DEC`, days of week accept `SUN`..`SAT` with both `0` and `7` meaning
//! Sunday. The `@yearly`, `@monthly`, `@weekly`, `@daily` and `@hourly` macros
//! are accepted as shorthands.
//!
//! Day-of-month and day-of-week follow the vixie cron rule: a field that
//! starts with `*` (including `*/n`) is unrestricted. When both fields are
//! restricted a day matches if either one matches, otherwise both must match.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone,
    Timelike, Utc,
};
use thiserror::Error;

/// Upper bound on how far ahead `next_after` searches.
const MAX_LOOKAHEAD_YEARS: i32 = 5;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Errors produced while parsing a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields, found {found}")]
    FieldCount { found: usize },
    #[error("unknown macro '{0}'")]
    UnknownMacro(String),
    #[error("{field}: empty list element")]
    EmptyElement { field: &'static str },
    #[error("{field}: invalid value '{value}'")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field}: value {value} outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("{field}: range start {start} is after end {end}")]
    InvertedRange {
        field: &'static str,
        start: u32,
        end: u32,
    },
    #[error("{field}: step must be a positive integer, got '{step}'")]
    InvalidStep { field: &'static str, step: String },
    #[error("day-of-month and month combination never occurs")]
    Unsatisfiable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            FieldKind::Minute => "minute",
            FieldKind::Hour => "hour",
            FieldKind::DayOfMonth => "day-of-month",
            FieldKind::Month => "month",
            FieldKind::DayOfWeek => "day-of-week",
        }
    }

    /// Inclusive bounds accepted in the expression text.
    fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            FieldKind::DayOfWeek => (0, 7),
        }
    }

    fn names(self) -> Option<(&'static [&'static str], u32)> {
        match self {
            FieldKind::Month => Some((&MONTH_NAMES, 1)),
            FieldKind::DayOfWeek => Some((&DAY_NAMES, 0)),
            _ => None,
        }
    }
}

/// One comma-separated element of a cron field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronItem {
    /// `*` or `*/step`
    Any { step: u32 },
    /// A single value
    Value(u32),
    /// `start-end` or `start-end/step`, also `start/step` (runs to the field maximum)
    Range { start: u32, end: u32, step: u32 },
}

/// A parsed field: its items plus the expanded set of matching values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    items: Vec<CronItem>,
    allowed: u64,
    restricted: bool,
}

impl CronField {
    fn parse(kind: FieldKind, text: &str) -> Result<Self, CronError> {
        let (min, max) = kind.bounds();
        let mut items = Vec::new();
        let mut allowed = 0u64;

        for raw in text.split(',') {
            if raw.is_empty() {
                return Err(CronError::EmptyElement { field: kind.name() });
            }
            let item = parse_item(kind, raw)?;
            let (start, end, step) = match item {
                CronItem::Any { step } => (min, max, step),
                CronItem::Value(v) => (v, v, 1),
                CronItem::Range { start, end, step } => (start, end, step),
            };
            for v in (start..=end).step_by(step as usize) {
                allowed |= 1u64 << v;
            }
            items.push(item);
        }

        if kind == FieldKind::DayOfWeek && allowed & (1u64 << 7) != 0 {
            allowed = (allowed & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            items,
            allowed,
            restricted: !text.starts_with('*'),
        })
    }

    pub fn items(&self) -> &[CronItem] {
        &self.items
    }

    pub fn matches(&self, value: u32) -> bool {
        value < 64 && self.allowed & (1u64 << value) != 0
    }

    /// Whether the field was written without a leading `*`.
    pub fn is_restricted(&self) -> bool {
        self.restricted
    }
}

fn parse_item(kind: FieldKind, raw: &str) -> Result<CronItem, CronError> {
    let (base, step) = match raw.split_once('/') {
        Some((base, step_text)) => {
            let step = step_text
                .parse::<u32>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| CronError::InvalidStep {
                    field: kind.name(),
                    step: step_text.to_string(),
                })?;
            (base, Some(step))
        }
        None => (raw, None),
    };

    if base == "*" {
        return Ok(CronItem::Any {
            step: step.unwrap_or(1),
        });
    }

    let (_, max) = kind.bounds();
    if let Some((start_text, end_text)) = base.split_once('-') {
        let start = parse_value(kind, start_text)?;
        let end = parse_value(kind, end_text)?;
        if start > end {
            return Err(CronError::InvertedRange {
                field: kind.name(),
                start,
                end,
            });
        }
        return Ok(CronItem::Range {
            start,
            end,
            step: step.unwrap_or(1),
        });
    }

    let value = parse_value(kind, base)?;
    match step {
        Some(step) => Ok(CronItem::Range {
            start: value,
            end: max,
            step,
        }),
        None => Ok(CronItem::Value(value)),
    }
}

fn parse_value(kind: FieldKind, text: &str) -> Result<u32, CronError> {
    let (min, max) = kind.bounds();

    let value = match text.parse::<u32>() {
        Ok(v) => v,
        Err(_) => {
            let upper = text.to_ascii_uppercase();
            kind.names()
                .and_then(|(names, offset)| {
                    names
                        .iter()
                        .position(|n| *n == upper)
                        .map(|idx| idx as u32 + offset)
                })
                .ok_or_else(|| CronError::InvalidValue {
                    field: kind.name(),
                    value: text.to_string(),
                })?
        }
    };

    if value < min || value > max {
        return Err(CronError::OutOfRange {
            field: kind.name(),
            value,
            min,
            max,
        });
    }
    Ok(value)
}

/// A validated cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronSchedule {
    /// Parse and validate an expression.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();
        let expanded = if trimmed.starts_with('@') {
            match trimmed.to_ascii_lowercase().as_str() {
                "@yearly" | "@annually" => "0 0 1 1 *",
                "@monthly" => "0 0 1 * *",
                "@weekly" => "0 0 * * 0",
                "@daily" | "@midnight" => "0 0 * * *",
                "@hourly" => "0 * * * *",
                _ => return Err(CronError::UnknownMacro(trimmed.to_string())),
            }
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount {
                found: fields.len(),
            });
        }

        let schedule = Self {
            source: trimmed.to_string(),
            minute: CronField::parse(FieldKind::Minute, fields[0])?,
            hour: CronField::parse(FieldKind::Hour, fields[1])?,
            day_of_month: CronField::parse(FieldKind::DayOfMonth, fields[2])?,
            month: CronField::parse(FieldKind::Month, fields[3])?,
            day_of_week: CronField::parse(FieldKind::DayOfWeek, fields[4])?,
        };

        if !schedule.is_satisfiable() {
            return Err(CronError::Unsatisfiable);
        }

        Ok(schedule)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn minute(&self) -> &CronField {
        &self.minute
    }

    pub fn hour(&self) -> &CronField {
        &self.hour
    }

    pub fn day_of_month(&self) -> &CronField {
        &self.day_of_month
    }

    pub fn month(&self) -> &CronField {
        &self.month
    }

    pub fn day_of_week(&self) -> &CronField {
        &self.day_of_week
    }

    // Only day-of-month driven schedules can be impossible (e.g. `0 0 30 2 *`).
    fn is_satisfiable(&self) -> bool {
        if self.day_of_month.is_restricted() && self.day_of_week.is_restricted() {
            return true;
        }
        (1..=12u32).filter(|m| self.month.matches(*m)).any(|m| {
            let days = days_in_month(2000, m); // leap year covers Feb 29
            (1..=days).any(|d| self.day_of_month.matches(d))
        })
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.matches(date.day());
        let dow = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday());
        if self.day_of_month.is_restricted() && self.day_of_week.is_restricted() {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether `at` (evaluated in `offset`) falls on a scheduled minute.
    pub fn matches(&self, at: DateTime<Utc>, offset: FixedOffset) -> bool {
        let local = at.with_timezone(&offset).naive_local();
        self.month.matches(local.month())
            && self.matches_day(local.date())
            && self.hour.matches(local.hour())
            && self.minute.matches(local.minute())
    }

    /// First scheduled minute strictly after `after`, with fields evaluated in `offset`.
    ///
    /// Returns `None` when nothing matches within the lookahead window.
    pub fn next_after(&self, after: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&offset).naive_local();
        let limit_year = local.year() + MAX_LOOKAHEAD_YEARS;

        let mut t = local
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;

        while t.year() <= limit_year {
            if !self.month.matches(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.matches_day(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.matches(t.hour()) {
                t = t
                    .with_minute(0)?
                    .checked_add_signed(Duration::hours(1))?;
                continue;
            }
            if !self.minute.matches(t.minute()) {
                t = t.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            return offset
                .from_local_datetime(&t)
                .single()
                .map(|dt| dt.with_timezone(&Utc));
        }

        None
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming(
        &self,
        after: DateTime<Utc>,
        offset: FixedOffset,
        count: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        while out.len() < count {
            match self.next_after(cursor, offset) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.and_then(|d| d.pred_opt()).map(|d| d.day()).unwrap_or(28)
}

/// Build a `FixedOffset` from minutes east of UTC, falling back to UTC when out of range.
pub fn offset_from_minutes(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix())
}
