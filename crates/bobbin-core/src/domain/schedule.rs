//! Schedule calculation: when should a task run next?
//!
//! Pure functions only. `now` is passed in so the result depends on the inputs
//! alone.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use super::errors::BobbinError;

/// Recurrence of a task: a fixed period or a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Interval {
    /// Fixed period in milliseconds, measured from the previous run's start.
    Millis(i64),
    /// Cron expression. Both 5-field (minute first) and 6/7-field (second
    /// first) forms are accepted.
    Cron(String),
}

impl Interval {
    pub fn millis(ms: i64) -> Self {
        Interval::Millis(ms)
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Interval::Cron(expression.into())
    }

    /// Fails with `InvalidSchedule` when the cron expression does not parse.
    pub fn validate(&self) -> Result<(), BobbinError> {
        match self {
            Interval::Millis(ms) if *ms <= 0 => Err(BobbinError::InvalidSchedule {
                expression: ms.to_string(),
                reason: "interval must be positive".to_string(),
            }),
            Interval::Millis(_) => Ok(()),
            Interval::Cron(expression) => parse_cron(expression).map(|_| ()),
        }
    }
}

fn parse_cron(expression: &str) -> Result<Schedule, BobbinError> {
    // the cron crate wants a leading seconds field
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| BobbinError::InvalidSchedule {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

fn to_datetime(ms: i64) -> Result<DateTime<Utc>, BobbinError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| BobbinError::Other(format!("timestamp out of range: {ms}")))
}

/// Next run time in unix ms, or `None` when the schedule is exhausted.
///
/// - cron: next matching instant strictly after `previous_run_start` (or `now`)
/// - period, no previous run: `now`
/// - period with a previous run: `previous_run_start + period`
/// - no interval, no previous run: `now` (one-shot, runs immediately)
/// - no interval with a previous run: `None`
pub fn compute_next_run(
    interval: Option<&Interval>,
    previous_run_start: Option<i64>,
    now: i64,
) -> Result<Option<i64>, BobbinError> {
    match (interval, previous_run_start) {
        (Some(Interval::Cron(expression)), previous) => {
            let schedule = parse_cron(expression)?;
            let base = to_datetime(previous.unwrap_or(now))?;
            Ok(schedule.after(&base).next().map(|at| at.timestamp_millis()))
        }
        (Some(Interval::Millis(_)), None) => Ok(Some(now)),
        (Some(Interval::Millis(ms)), Some(start)) => Ok(Some(start + ms)),
        (None, None) => Ok(Some(now)),
        (None, Some(_)) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    const NOW: i64 = 1_700_000_000_000;

    #[rstest]
    #[case(None, None, Some(NOW))]
    #[case(None, Some(NOW - 10), None)]
    #[case(Some(Interval::Millis(60_000)), None, Some(NOW))]
    #[case(Some(Interval::Millis(60_000)), Some(NOW - 5_000), Some(NOW + 55_000))]
    fn fixed_and_one_shot_schedules(
        #[case] interval: Option<Interval>,
        #[case] previous: Option<i64>,
        #[case] expected: Option<i64>,
    ) {
        let next = compute_next_run(interval.as_ref(), previous, NOW).unwrap();
        assert_eq!(next, expected);
    }

    #[test]
    fn numeric_interval_is_deterministic() {
        let interval = Interval::millis(1_000);
        for now in [NOW, NOW + 1, NOW + 99_999] {
            let next = compute_next_run(Some(&interval), Some(NOW - 300), now).unwrap();
            assert_eq!(next, Some(NOW + 700));
        }
    }

    #[test]
    fn cron_resolves_strictly_after_previous_start() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let interval = Interval::cron("*/5 * * * *");

        let next = compute_next_run(Some(&interval), Some(start.timestamp_millis()), NOW)
            .unwrap()
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 0).unwrap();
        assert_eq!(next, expected.timestamp_millis());
    }

    #[test]
    fn cron_without_previous_run_uses_now() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 30).unwrap();
        let interval = Interval::cron("0 0 * * * *");

        let next = compute_next_run(Some(&interval), None, now.timestamp_millis())
            .unwrap()
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap();
        assert_eq!(next, expected.timestamp_millis());
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let interval = Interval::cron("every tuesday");
        let err = compute_next_run(Some(&interval), None, NOW).unwrap_err();
        assert!(matches!(err, BobbinError::InvalidSchedule { .. }));
        assert!(interval.validate().is_err());
    }

    #[test]
    fn interval_deserializes_from_number_or_string() {
        let millis: Interval = serde_json::from_str("1500").unwrap();
        assert_eq!(millis, Interval::Millis(1500));
        let cron: Interval = serde_json::from_str("\"0 * * * *\"").unwrap();
        assert_eq!(cron, Interval::cron("0 * * * *"));
    }
}
