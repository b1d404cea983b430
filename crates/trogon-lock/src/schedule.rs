use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;

use crate::error::LockError;

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Longest accepted interval, about 136 years.
const MAX_INTERVAL_SEC: u64 = u32::MAX as u64;

/// When a task fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire on start, then every N seconds (minimum 1).
    Interval { interval_sec: u64 },
    /// Six fields: `sec min hour day-of-month month day-of-week`.
    ///
    /// Month is `0-11` (0 = January) and day-of-week is `0-6` (0 = Sunday).
    /// Three-letter names (`Jan`, `Mon`) are accepted as well. Evaluated in UTC.
    Cron { expr: String },
}

impl Schedule {
    pub fn every(interval_sec: u64) -> Self {
        Self::Interval { interval_sec }
    }

    pub fn cron(expr: impl Into<String>) -> Self {
        Self::Cron { expr: expr.into() }
    }

    /// Validate and parse. Nothing is registered until this succeeds.
    pub fn compile(&self) -> Result<CompiledSchedule, LockError> {
        match self {
            Self::Interval { interval_sec } => {
                if *interval_sec == 0 {
                    return Err(LockError::InvalidSchedule {
                        expr: self.to_string(),
                        reason: "interval_sec must be >= 1".into(),
                    });
                }
                if *interval_sec > MAX_INTERVAL_SEC {
                    return Err(LockError::InvalidSchedule {
                        expr: self.to_string(),
                        reason: "interval_sec is too large".into(),
                    });
                }
                Ok(CompiledSchedule::Interval(Duration::from_secs(*interval_sec)))
            }
            Self::Cron { expr } => {
                let normalized = normalize_cron(expr)?;
                let parsed = cron::Schedule::from_str(&normalized).map_err(|e| {
                    LockError::InvalidSchedule {
                        expr: expr.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(CompiledSchedule::Cron(Box::new(parsed)))
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval { interval_sec } => write!(f, "every {interval_sec}s"),
            Self::Cron { expr } => write!(f, "cron '{expr}'"),
        }
    }
}

/// Rewrite a six-field expression so the month and day-of-week fields use
/// names, which the `cron` crate reads unambiguously. Other fields pass
/// through untouched and are range-checked by the parser.
pub fn normalize_cron(expr: &str) -> Result<String, LockError> {
    let invalid = |reason: String| LockError::InvalidSchedule {
        expr: expr.to_string(),
        reason,
    };

    let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    if fields.len() != 6 {
        return Err(invalid(format!(
            "expected 6 fields (sec min hour day-of-month month day-of-week), got {}",
            fields.len()
        )));
    }

    fields[4] = normalize_field(&fields[4], &MONTHS, "month").map_err(invalid)?;
    fields[5] = normalize_field(&fields[5], &WEEKDAYS, "day-of-week").map_err(invalid)?;
    Ok(fields.join(" "))
}

fn normalize_field(field: &str, names: &[&str], label: &str) -> Result<String, String> {
    let items = field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (item, None),
            };
            let base = match base {
                "*" | "?" => base.to_string(),
                _ => base
                    .split('-')
                    .map(|part| name_for(part, names, label))
                    .collect::<Result<Vec<_>, _>>()?
                    .join("-"),
            };
            Ok(match step {
                Some(step) => format!("{base}/{step}"),
                None => base,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(items.join(","))
}

fn name_for(part: &str, names: &[&str], label: &str) -> Result<String, String> {
    match part.parse::<usize>() {
        Ok(n) if n < names.len() => Ok(names[n].to_string()),
        Ok(n) => Err(format!(
            "{label} value {n} is out of range 0-{}",
            names.len() - 1
        )),
        // Already a name; the parser decides.
        Err(_) => Ok(part.to_string()),
    }
}

/// A validated schedule, ready to drive a trigger.
#[derive(Debug, Clone)]
pub enum CompiledSchedule {
    Interval(Duration),
    Cron(Box<cron::Schedule>),
}

impl CompiledSchedule {
    /// First tick strictly after `after`, or `None` if the schedule has no
    /// further ticks.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(period) => chrono::Duration::from_std(*period)
                .ok()
                .map(|period| after + period),
            Self::Cron(schedule) => schedule.after(&after).next(),
        }
    }

    /// Must be called from inside the runtime that will poll it.
    pub(crate) fn ticker(&self) -> Ticker {
        match self {
            Self::Interval(period) => {
                let mut interval = tokio::time::interval(*period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Ticker::Interval(interval)
            }
            Self::Cron(schedule) => Ticker::Cron(schedule.clone()),
        }
    }
}

pub(crate) enum Ticker {
    Interval(tokio::time::Interval),
    Cron(Box<cron::Schedule>),
}

impl Ticker {
    /// Wait for the next tick. Returns `false` when the schedule is exhausted.
    ///
    /// Cron ticks are computed from the time this is called, so ticks that
    /// came due while the previous callback was running are skipped.
    pub(crate) async fn tick(&mut self) -> bool {
        match self {
            Self::Interval(interval) => {
                interval.tick().await;
                true
            }
            Self::Cron(schedule) => {
                let now = Utc::now();
                let Some(next) = schedule.after(&now).next() else {
                    return false;
                };
                let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn month_and_weekday_numbers_become_names() {
        assert_eq!(
            normalize_cron("0 0 12 * 0 1-5").unwrap(),
            "0 0 12 * Jan Mon-Fri"
        );
        assert_eq!(
            normalize_cron("0 0 0 1 11 0,6").unwrap(),
            "0 0 0 1 Dec Sun,Sat"
        );
    }

    #[test]
    fn wildcards_and_steps_are_kept() {
        assert_eq!(
            normalize_cron("*/15 * * * * *").unwrap(),
            "*/15 * * * * *"
        );
        assert_eq!(
            normalize_cron("0 0 0 1 */3 *").unwrap(),
            "0 0 0 1 */3 *"
        );
    }

    #[test]
    fn names_pass_through() {
        assert_eq!(
            normalize_cron("0 30 9 * * Mon").unwrap(),
            "0 30 9 * * Mon"
        );
    }

    #[test]
    fn month_twelve_is_out_of_range() {
        let err = normalize_cron("0 0 0 1 12 *").unwrap_err();
        assert!(err.to_string().contains("month value 12"));
    }

    #[test]
    fn weekday_seven_is_out_of_range() {
        let err = normalize_cron("0 0 0 * * 7").unwrap_err();
        assert!(err.to_string().contains("day-of-week value 7"));
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        let err = Schedule::cron("0 * * * *").compile().unwrap_err();
        assert!(matches!(err, LockError::InvalidSchedule { .. }));
        assert!(err.to_string().contains("expected 6 fields"));
    }

    #[test]
    fn garbage_is_rejected_by_the_parser() {
        assert!(matches!(
            Schedule::cron("a b c d e f").compile(),
            Err(LockError::InvalidSchedule { .. })
        ));
        assert!(matches!(
            Schedule::cron("0 99 * * * *").compile(),
            Err(LockError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = Schedule::every(0).compile().unwrap_err();
        assert!(err.to_string().contains("interval_sec"));
    }

    #[test]
    fn interval_next_is_one_period_later() {
        let compiled = Schedule::every(30).compile().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            compiled.next_after(at),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap())
        );
    }

    #[test]
    fn weekday_one_is_monday() {
        // 2024-01-01 is a Monday.
        let compiled = Schedule::cron("0 30 9 * * 1").compile().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(
            compiled.next_after(at),
            Some(Utc.with_ymd_and_hms(2024, 1, 8, 9, 30, 0).unwrap())
        );
    }

    #[test]
    fn month_zero_is_january() {
        let compiled = Schedule::cron("0 0 0 1 0 *").compile().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        assert_eq!(
            compiled.next_after(at),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn schedule_deserializes_from_tagged_json() {
        let s: Schedule =
            serde_json::from_str(r#"{"type":"cron","expr":"0 */5 * * * *"}"#).unwrap();
        assert_eq!(s, Schedule::cron("0 */5 * * * *"));
        let s: Schedule = serde_json::from_str(r#"{"type":"interval","interval_sec":60}"#).unwrap();
        assert_eq!(s, Schedule::every(60));
    }
}
