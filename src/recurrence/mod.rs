//! Recurrence rules: pure predicates over instants at minute resolution.
//!
//! A rule starts inert (it never matches). Every constraint applied to it
//! narrows the set of matching instants; constraints never widen it.

pub mod cron;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Timelike, Utc};

pub use self::cron::{CronExpression, Field};

/// Extra gating predicate over the (minute-truncated, UTC) candidate instant.
pub type Guard = Arc<dyn Fn(&DateTime<Utc>) -> bool + Send + Sync + 'static>;

/// Truncates an instant to the start of its minute.
pub fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
  instant
    .with_second(0)
    .and_then(|dt| dt.with_nanosecond(0))
    .unwrap_or(instant)
}

/// A conjunctive set of time constraints plus optional guard predicates.
#[derive(Clone, Default)]
pub struct RecurrenceRule {
  expression: Option<CronExpression>,
  last_day_of_month: bool,
  offset: Option<FixedOffset>,
  guards: Vec<Guard>,
  #[cfg(feature = "cron_schedule")]
  extended: Vec<::cron::Schedule>,
}

impl fmt::Debug for RecurrenceRule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RecurrenceRule")
      .field("expression", &self.expression.as_ref().map(ToString::to_string))
      .field("last_day_of_month", &self.last_day_of_month)
      .field("offset", &self.offset)
      .field("guards", &format_args!("{} guard(s)", self.guards.len()))
      .field("extended", &self.extended_count())
      .finish()
  }
}

impl RecurrenceRule {
  /// A rule with no constraints. It never matches until one is applied.
  pub fn new() -> Self {
    Self::default()
  }

  /// Narrows the rule with a cron expression.
  pub fn constrain(&mut self, expression: CronExpression) -> &mut Self {
    self.expression = Some(match self.expression.take() {
      Some(existing) => existing.intersect(&expression),
      None => expression,
    });
    self
  }

  /// Restricts matches to the last calendar day of the month.
  pub fn require_last_day_of_month(&mut self) -> &mut Self {
    self.last_day_of_month = true;
    if self.expression.is_none() {
      self.expression = Some(CronExpression::every_minute());
    }
    self
  }

  /// Adds a guard predicate; all guards must hold.
  pub fn add_guard(&mut self, guard: Guard) -> &mut Self {
    self.guards.push(guard);
    self
  }

  /// Evaluates time components in `offset` instead of UTC.
  pub fn set_offset(&mut self, offset: FixedOffset) -> &mut Self {
    self.offset = Some(offset);
    self
  }

  /// Narrows the rule with a seconds-aware expression evaluated by the `cron`
  /// crate at second 0 of the candidate minute.
  #[cfg(feature = "cron_schedule")]
  pub fn constrain_extended(
    &mut self,
    expression: &str,
  ) -> Result<&mut Self, crate::error::RecurrenceError> {
    use std::str::FromStr;

    let schedule = ::cron::Schedule::from_str(expression).map_err(|e| {
      crate::error::RecurrenceError::InvalidExtended {
        expression: expression.to_string(),
        reason: e.to_string(),
      }
    })?;
    self.extended.push(schedule);
    Ok(self)
  }

  /// `true` once at least one time constraint has been applied.
  pub fn is_constrained(&self) -> bool {
    self.expression.is_some() || self.extended_count() > 0
  }

  pub fn expression(&self) -> Option<&CronExpression> {
    self.expression.as_ref()
  }

  /// Returns `true` if the rule matches `instant` (truncated to the minute).
  pub fn is_due(&self, instant: DateTime<Utc>) -> bool {
    if !self.is_constrained() {
      return false;
    }
    let instant = truncate_to_minute(instant);
    let components_match = match self.offset {
      Some(offset) => self.components_match(&instant.with_timezone(&offset)),
      None => self.components_match(&instant),
    };
    components_match && self.guards.iter().all(|guard| guard(&instant))
  }

  fn components_match<Tz: TimeZone>(&self, local: &DateTime<Tz>) -> bool {
    if let Some(expression) = &self.expression {
      if !expression.matches(local) {
        return false;
      }
    }
    if self.last_day_of_month && !is_last_day_of_month(local) {
      return false;
    }
    self.extended_match(local)
  }

  #[cfg(feature = "cron_schedule")]
  fn extended_count(&self) -> usize {
    self.extended.len()
  }

  #[cfg(not(feature = "cron_schedule"))]
  fn extended_count(&self) -> usize {
    0
  }

  #[cfg(feature = "cron_schedule")]
  fn extended_match<Tz: TimeZone>(&self, local: &DateTime<Tz>) -> bool {
    let just_before = local.clone() - chrono::Duration::seconds(1);
    self
      .extended
      .iter()
      .all(|schedule| schedule.after(&just_before).next().as_ref() == Some(local))
  }

  #[cfg(not(feature = "cron_schedule"))]
  fn extended_match<Tz: TimeZone>(&self, _local: &DateTime<Tz>) -> bool {
    true
  }
}

fn is_last_day_of_month<Tz: TimeZone>(local: &DateTime<Tz>) -> bool {
  local
    .date_naive()
    .succ_opt()
    .map_or(true, |next| next.day() == 1)
}
