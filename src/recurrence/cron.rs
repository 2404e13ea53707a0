//! Cron expression parsing and evaluation.
//!
//! Supports standard 5-field cron expressions:
//! ```text
//! ┌───────────── minute (0-59)
//! │ ┌───────────── hour (0-23)
//! │ │ ┌───────────── day of month (1-31)
//! │ │ │ ┌───────────── month (1-12 or JAN-DEC)
//! │ │ │ │ ┌───────────── day of week (0-7 or SUN-SAT, 0 and 7 = Sunday)
//! │ │ │ │ │
//! * * * * *
//! ```
//!
//! Each field accepts `*`, single values, `a-b` ranges, `/step` suffixes and
//! comma separated lists. Day of month and day of week are combined with AND,
//! unlike Vixie cron: `0 0 13 * 5` only matches Friday the 13th.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Weekday};

use crate::error::RecurrenceError;

const MONTH_NAMES: [&str; 12] = [
  "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Static description of one cron field.
struct FieldSpec {
  name: &'static str,
  min: u32,
  max: u32,
  /// Symbolic names, the first one mapping to `name_base`.
  names: &'static [&'static str],
  name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
  name: "minute",
  min: 0,
  max: 59,
  names: &[],
  name_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
  name: "hour",
  min: 0,
  max: 23,
  names: &[],
  name_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
  name: "day-of-month",
  min: 1,
  max: 31,
  names: &[],
  name_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
  name: "month",
  min: 1,
  max: 12,
  names: &MONTH_NAMES,
  name_base: 1,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
  name: "day-of-week",
  min: 0,
  max: 7,
  names: &WEEKDAY_NAMES,
  name_base: 0,
};

/// One time component constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
  /// Unconstrained.
  Any,
  /// Matches only the listed values. An empty set never matches.
  Values(BTreeSet<u32>),
}

impl Field {
  pub fn single(value: u32) -> Self {
    Field::Values(BTreeSet::from([value]))
  }

  pub fn values(values: impl IntoIterator<Item = u32>) -> Self {
    Field::Values(values.into_iter().collect())
  }

  pub fn is_any(&self) -> bool {
    matches!(self, Field::Any)
  }

  pub fn matches(&self, value: u32) -> bool {
    match self {
      Field::Any => true,
      Field::Values(values) => values.contains(&value),
    }
  }

  /// Values matched by both fields.
  pub fn intersect(&self, other: &Field) -> Field {
    match (self, other) {
      (Field::Any, f) | (f, Field::Any) => f.clone(),
      (Field::Values(a), Field::Values(b)) => Field::Values(a.intersection(b).copied().collect()),
    }
  }

  fn parse(spec: &FieldSpec, expr: &str) -> Result<Self, RecurrenceError> {
    let mut values = BTreeSet::new();
    for part in expr.split(',') {
      let part = part.trim();
      if part == "*" || part == "?" {
        return Ok(Field::Any);
      }
      parse_part(spec, part, &mut values)?;
    }
    Ok(Field::Values(values))
  }
}

impl fmt::Display for Field {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Field::Any => f.write_str("*"),
      Field::Values(values) if values.is_empty() => f.write_str("none"),
      Field::Values(values) => {
        let joined: Vec<String> = values.iter().map(u32::to_string).collect();
        f.write_str(&joined.join(","))
      }
    }
  }
}

fn invalid(spec: &FieldSpec, part: &str, reason: impl Into<String>) -> RecurrenceError {
  RecurrenceError::InvalidField {
    field: spec.name,
    part: part.to_string(),
    reason: reason.into(),
  }
}

/// Parse a single part of a field expression (e.g. `5`, `1-5`, `*/15`, `MON-FRI`, `10/5`).
fn parse_part(spec: &FieldSpec, part: &str, values: &mut BTreeSet<u32>) -> Result<(), RecurrenceError> {
  let (range_part, step) = match part.split_once('/') {
    Some((range, step_str)) => {
      let step = step_str
        .parse::<u32>()
        .map_err(|_| invalid(spec, part, "invalid step"))?;
      if step == 0 {
        return Err(invalid(spec, part, "step must be greater than zero"));
      }
      if step > spec.max {
        return Err(invalid(spec, part, "step out of range"));
      }
      (range, Some(step))
    }
    None => (part, None),
  };

  let (start, end) = if range_part == "*" {
    (spec.min, spec.max)
  } else if let Some((start, end)) = range_part.split_once('-') {
    let start = parse_value(spec, start, part)?;
    let end = parse_value(spec, end, part)?;
    if start > end {
      return Err(invalid(spec, part, format!("range start {start} is after end {end}")));
    }
    (start, end)
  } else {
    let value = parse_value(spec, range_part, part)?;
    // `10/5` means "from 10 to the end of the field, every 5".
    match step {
      Some(_) => (value, spec.max),
      None => (value, value),
    }
  };

  let step = step.unwrap_or(1);
  let mut value = start;
  loop {
    values.insert(normalize(spec, value));
    match value.checked_add(step) {
      Some(next) if next <= end => value = next,
      _ => break,
    }
  }
  Ok(())
}

fn parse_value(spec: &FieldSpec, raw: &str, part: &str) -> Result<u32, RecurrenceError> {
  let raw = raw.trim();
  let value = match raw.parse::<u32>() {
    Ok(value) => value,
    Err(_) => spec
      .names
      .iter()
      .position(|name| name.eq_ignore_ascii_case(raw))
      .map(|index| index as u32 + spec.name_base)
      .ok_or_else(|| invalid(spec, part, format!("'{raw}' is not a number or known name")))?,
  };
  check_range(spec, value)
}

fn check_range(spec: &FieldSpec, value: u32) -> Result<u32, RecurrenceError> {
  if value < spec.min || value > spec.max {
    return Err(RecurrenceError::OutOfRange {
      field: spec.name,
      value,
      min: spec.min,
      max: spec.max,
    });
  }
  Ok(value)
}

// Day-of-week 7 is an alias for Sunday.
fn normalize(spec: &FieldSpec, value: u32) -> u32 {
  if spec.name == DAY_OF_WEEK.name && value == 7 {
    0
  } else {
    value
  }
}

/// A parsed cron expression: one [`Field`] per time component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
  pub minute: Field,
  pub hour: Field,
  pub day_of_month: Field,
  pub month: Field,
  pub day_of_week: Field,
}

impl CronExpression {
  /// Parse a 5-field cron expression string.
  pub fn parse(expr: &str) -> Result<Self, RecurrenceError> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() != 5 {
      return Err(RecurrenceError::InvalidFieldCount {
        expression: expr.to_string(),
        count: parts.len(),
      });
    }

    Ok(Self {
      minute: Field::parse(&MINUTE, parts[0])?,
      hour: Field::parse(&HOUR, parts[1])?,
      day_of_month: Field::parse(&DAY_OF_MONTH, parts[2])?,
      month: Field::parse(&MONTH, parts[3])?,
      day_of_week: Field::parse(&DAY_OF_WEEK, parts[4])?,
    })
  }

  /// `* * * * *`
  pub fn every_minute() -> Self {
    Self {
      minute: Field::Any,
      hour: Field::Any,
      day_of_month: Field::Any,
      month: Field::Any,
      day_of_week: Field::Any,
    }
  }

  /// Every `step` minutes, starting at minute 0 of each hour.
  pub fn every_n_minutes(step: u32) -> Result<Self, RecurrenceError> {
    if step == 0 || step > MINUTE.max {
      return Err(RecurrenceError::OutOfRange {
        field: "minute step",
        value: step,
        min: 1,
        max: MINUTE.max,
      });
    }
    Ok(Self::minute_steps(step))
  }

  /// Every `step` minutes from minute 0, with `step` clamped to `1..=59`.
  pub(crate) fn minute_steps(step: u32) -> Self {
    let step = step.clamp(1, MINUTE.max);
    Self {
      minute: Field::values((0..=MINUTE.max).step_by(step as usize)),
      ..Self::every_minute()
    }
  }

  /// `M * * * *`
  pub fn hourly_at(minute: u32) -> Result<Self, RecurrenceError> {
    Ok(Self {
      minute: Field::single(check_range(&MINUTE, minute)?),
      ..Self::every_minute()
    })
  }

  /// `M H * * *`
  pub fn daily_at(hour: u32, minute: u32) -> Result<Self, RecurrenceError> {
    Ok(Self {
      hour: Field::single(check_range(&HOUR, hour)?),
      ..Self::hourly_at(minute)?
    })
  }

  /// `M H * * W`
  pub fn weekly_on(weekday: Weekday, hour: u32, minute: u32) -> Result<Self, RecurrenceError> {
    Ok(Self {
      day_of_week: Field::single(weekday.num_days_from_sunday()),
      ..Self::daily_at(hour, minute)?
    })
  }

  /// `0 0 D * *`
  pub fn monthly_on(day: u32) -> Result<Self, RecurrenceError> {
    Ok(Self {
      day_of_month: Field::single(check_range(&DAY_OF_MONTH, day)?),
      ..Self::daily_at(0, 0)?
    })
  }

  /// `* * * * <days>`: restricts only the day of week.
  pub fn on_weekdays(days: &[Weekday]) -> Self {
    Self {
      day_of_week: Field::values(days.iter().map(Weekday::num_days_from_sunday)),
      ..Self::every_minute()
    }
  }

  /// Conjunction of both expressions, field by field.
  pub fn intersect(&self, other: &CronExpression) -> CronExpression {
    Self {
      minute: self.minute.intersect(&other.minute),
      hour: self.hour.intersect(&other.hour),
      day_of_month: self.day_of_month.intersect(&other.day_of_month),
      month: self.month.intersect(&other.month),
      day_of_week: self.day_of_week.intersect(&other.day_of_week),
    }
  }

  /// Check if a datetime matches this cron expression. Seconds are ignored.
  pub fn matches<Tz: TimeZone>(&self, dt: &DateTime<Tz>) -> bool {
    self.minute.matches(dt.minute())
      && self.hour.matches(dt.hour())
      && self.day_of_month.matches(dt.day())
      && self.month.matches(dt.month())
      && self.day_of_week.matches(dt.weekday().num_days_from_sunday())
  }
}

impl FromStr for CronExpression {
  type Err = RecurrenceError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    CronExpression::parse(s)
  }
}

impl fmt::Display for CronExpression {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} {} {} {} {}",
      self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
    )
  }
}
