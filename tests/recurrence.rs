mod common;
use crate::common::{setup_tracing, utc};

use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};
use steward::{CronExpression, Field, RecurrenceError, RecurrenceRule};

fn rule(expression: &str) -> RecurrenceRule {
  let mut rule = RecurrenceRule::new();
  rule.constrain(CronExpression::parse(expression).expect("valid expression"));
  rule
}

#[test]
fn test_unconstrained_rule_never_matches() {
  setup_tracing();
  let mut rule = RecurrenceRule::new();
  assert!(!rule.is_constrained());
  assert!(!rule.is_due(utc(2018, 6, 7, 0, 0)));

  rule.add_guard(Arc::new(|_: &DateTime<Utc>| true));
  assert!(!rule.is_due(utc(2018, 6, 7, 0, 0)));
}

#[test]
fn test_daily_at_midnight() {
  setup_tracing();
  let rule = rule("0 0 * * *");
  assert!(rule.is_due(utc(2018, 6, 7, 0, 0)));
  assert!(rule.is_due(utc(2018, 6, 9, 0, 0)));
  assert!(!rule.is_due(utc(2018, 6, 7, 0, 1)));
}

#[test]
fn test_month_end_and_leap_years() {
  setup_tracing();
  let mut last_day = RecurrenceRule::new();
  last_day
    .constrain(CronExpression::daily_at(0, 0).unwrap())
    .require_last_day_of_month();

  assert!(last_day.is_due(utc(2018, 6, 30, 0, 0)));
  assert!(!last_day.is_due(utc(2018, 6, 29, 0, 0)));
  assert!(last_day.is_due(utc(2018, 12, 31, 0, 0)));
  assert!(last_day.is_due(utc(2019, 2, 28, 0, 0)));
  assert!(!last_day.is_due(utc(2020, 2, 28, 0, 0)));
  assert!(last_day.is_due(utc(2020, 2, 29, 0, 0)));

  // Day 31 only exists in some months.
  let thirty_first = rule("0 0 31 * *");
  assert!(thirty_first.is_due(utc(2018, 7, 31, 0, 0)));
  let june_days: Vec<u32> = (1..=30)
    .filter(|day| thirty_first.is_due(utc(2018, 6, *day, 0, 0)))
    .collect();
  assert!(june_days.is_empty());

  // February 29th only in leap years.
  let leap_day = rule("0 12 29 2 *");
  assert!(leap_day.is_due(utc(2024, 2, 29, 12, 0)));
  assert!(!leap_day.is_due(utc(2023, 3, 1, 12, 0)));
}

#[test]
fn test_day_of_month_and_day_of_week_combine_with_and() {
  setup_tracing();
  // Friday the 13th.
  let rule = rule("0 0 13 * FRI");
  assert!(rule.is_due(utc(2018, 7, 13, 0, 0)));
  assert!(!rule.is_due(utc(2018, 6, 13, 0, 0))); // Wednesday
  assert!(!rule.is_due(utc(2018, 7, 6, 0, 0))); // Friday the 6th
}

#[test]
fn test_steps_ranges_lists_and_names() {
  setup_tracing();
  let expr = CronExpression::parse("*/15 9-17 * JAN,jul MON-FRI").unwrap();
  assert_eq!(expr.minute, Field::values([0, 15, 30, 45]));
  assert_eq!(expr.hour, Field::values(9..=17));
  assert_eq!(expr.month, Field::values([1, 7]));
  assert_eq!(expr.day_of_week, Field::values(1..=5));
  assert!(expr.day_of_month.is_any());

  let offset_step = CronExpression::parse("10/20 * * * *").unwrap();
  assert_eq!(offset_step.minute, Field::values([10, 30, 50]));

  // 7 is Sunday, like 0.
  let sunday = CronExpression::parse("0 0 * * 7").unwrap();
  assert_eq!(sunday.day_of_week, Field::single(0));
  assert_eq!(sunday.to_string(), "0 0 * * 0");
}

#[test]
fn test_parse_errors() {
  setup_tracing();
  assert!(matches!(
    CronExpression::parse("* * * *"),
    Err(RecurrenceError::InvalidFieldCount { count: 4, .. })
  ));
  assert!(matches!(
    CronExpression::parse("60 * * * *"),
    Err(RecurrenceError::OutOfRange { field: "minute", value: 60, .. })
  ));
  assert!(matches!(
    CronExpression::parse("* * 0 * *"),
    Err(RecurrenceError::OutOfRange { field: "day-of-month", .. })
  ));
  assert!(matches!(
    CronExpression::parse("*/0 * * * *"),
    Err(RecurrenceError::InvalidField { field: "minute", .. })
  ));
  assert!(matches!(
    CronExpression::parse("* * * FOO *"),
    Err(RecurrenceError::InvalidField { field: "month", .. })
  ));
  assert!(matches!(
    CronExpression::parse("* 5-2 * * *"),
    Err(RecurrenceError::InvalidField { field: "hour", .. })
  ));
  assert!(matches!(
    CronExpression::parse("59/4294967295 * * * *"),
    Err(RecurrenceError::InvalidField { field: "minute", .. })
  ));
  assert!(matches!(
    CronExpression::parse("0 */24 * * *"),
    Err(RecurrenceError::InvalidField { field: "hour", .. })
  ));
  assert!("0 0 * * *".parse::<CronExpression>().is_ok());
}

#[test]
fn test_large_steps_stop_at_field_end() {
  setup_tracing();
  let at_fifty = rule("50/59 * * * *");
  assert!(at_fifty.is_due(utc(2018, 6, 7, 10, 50)));
  for minute in [0, 9, 49, 51, 59] {
    assert!(!at_fifty.is_due(utc(2018, 6, 7, 10, minute)), "minute {minute}");
  }
  let sundays = rule("0 0 * * 0/7");
  assert!(sundays.is_due(utc(2018, 6, 10, 0, 0)));
  assert!(!sundays.is_due(utc(2018, 6, 11, 0, 0)));
}

#[test]
fn test_constraints_intersect() {
  setup_tracing();
  let mut rule = RecurrenceRule::new();
  rule
    .constrain(CronExpression::daily_at(9, 0).unwrap())
    .constrain(CronExpression::on_weekdays(&[Weekday::Mon, Weekday::Wed]));

  assert_eq!(rule.expression().unwrap().to_string(), "0 9 * * 1,3");
  assert!(rule.is_due(utc(2018, 6, 4, 9, 0))); // Monday
  assert!(!rule.is_due(utc(2018, 6, 5, 9, 0))); // Tuesday

  // Disjoint constraints never match.
  let mut never = RecurrenceRule::new();
  never
    .constrain(CronExpression::hourly_at(0).unwrap())
    .constrain(CronExpression::hourly_at(30).unwrap());
  assert_eq!(never.expression().unwrap().minute, Field::values([]));
  assert!((0..60).all(|minute| !never.is_due(utc(2018, 6, 4, 9, minute))));
}

#[test]
fn test_guards_gate_matches() {
  setup_tracing();
  let mut rule = rule("* * * * *");
  rule.add_guard(Arc::new(|instant: &DateTime<Utc>| instant.minute() % 2 == 0));
  rule.add_guard(Arc::new(|instant: &DateTime<Utc>| instant.day() != 13));

  assert!(rule.is_due(utc(2018, 6, 7, 10, 2)));
  assert!(!rule.is_due(utc(2018, 6, 7, 10, 3)));
  assert!(!rule.is_due(utc(2018, 6, 13, 10, 2)));
}

#[test]
fn test_zoned_rule_uses_local_components() {
  setup_tracing();
  let mut rule = rule("0 9 * * MON");
  rule.set_offset(FixedOffset::east_opt(2 * 3600).unwrap());

  // 09:00 at UTC+2 on Monday 2018-06-04 is 07:00 UTC.
  assert!(rule.is_due(utc(2018, 6, 4, 7, 0)));
  assert!(!rule.is_due(utc(2018, 6, 4, 9, 0)));

  // Crossing midnight changes the weekday too: 00:30 Monday local is Sunday UTC.
  let mut early = self::rule("30 0 * * MON");
  early.set_offset(FixedOffset::east_opt(3600).unwrap());
  assert!(early.is_due(utc(2018, 6, 3, 23, 30)));
}

#[test]
fn test_matching_is_pure() {
  setup_tracing();
  let rule = rule("*/5 * * * *");
  let instant = utc(2018, 6, 7, 10, 35);
  let first = rule.is_due(instant);
  for _ in 0..10 {
    assert_eq!(rule.is_due(instant), first);
  }
  assert!(first);
}

#[cfg(feature = "cron_schedule")]
#[test]
fn test_extended_expression_matches_second_zero() {
  setup_tracing();
  let mut rule = RecurrenceRule::new();
  rule
    .constrain_extended("0 */10 * * * * *")
    .expect("valid extended expression");

  assert!(rule.is_due(utc(2018, 6, 7, 10, 20)));
  assert!(!rule.is_due(utc(2018, 6, 7, 10, 21)));

  assert!(matches!(
    RecurrenceRule::new().constrain_extended("not cron"),
    Err(RecurrenceError::InvalidExtended { .. })
  ));
}
