use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use cron::Schedule;

use crate::error::{SchedulerError, SchedulerResult};

/// Evaluates standard 5-field cron expressions
/// (minute hour day-of-month month day-of-week) in host local time.
///
/// The underlying schedule engine takes a seconds field, so a validated
/// 5-field expression is pinned to second zero before parsing. This keeps
/// the external format at exactly five fields and fires at most once per
/// logical minute, including across DST transitions (nonexistent local
/// times roll forward).
pub struct CronEvaluator;

impl CronEvaluator {
    /// Parse and validate a 5-field expression. Malformed input is rejected
    /// here so it never reaches the runtime.
    pub fn parse(expr: &str) -> SchedulerResult<Schedule> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::InvalidCron {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }
        let with_seconds = format!("0 {}", fields.join(" "));
        Schedule::from_str(&with_seconds).map_err(|err| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason: err.to_string(),
        })
    }

    pub fn validate(expr: &str) -> SchedulerResult<()> {
        Self::parse(expr).map(|_| ())
    }

    /// Smallest instant strictly after `after` matching all five fields.
    pub fn next_run(expr: &str, after: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>> {
        let schedule = Self::parse(expr)?;
        schedule
            .after(&after.with_timezone(&Local))
            .next()
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule(format!("cron `{}` has no future occurrence", expr))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn rejects_wrong_field_counts() {
        assert!(CronEvaluator::validate("* * * *").is_err());
        assert!(CronEvaluator::validate("0 0 * * * *").is_err());
        assert!(CronEvaluator::validate("").is_err());
    }

    #[test]
    fn rejects_malformed_fields() {
        assert!(CronEvaluator::validate("61 * * * *").is_err());
        assert!(CronEvaluator::validate("a b c d e").is_err());
        assert!(CronEvaluator::validate("5- * * * *").is_err());
    }

    #[test]
    fn accepts_steps_ranges_and_lists() {
        for expr in [
            "* * * * *",
            "*/15 * * * *",
            "0 9 * * 1-5",
            "5,20,35,50 0-6/2 1 * *",
            "30 4 1,15 * *",
        ] {
            assert!(CronEvaluator::validate(expr).is_ok(), "expr: {}", expr);
        }
    }

    #[test]
    fn next_run_is_strictly_after() {
        let now = Utc::now();
        let next = CronEvaluator::next_run("* * * * *", now).expect("next");
        assert!(next > now);
        assert!(next - now <= chrono::Duration::seconds(61));
    }

    #[test]
    fn next_run_matches_minute_field() {
        let now = Utc::now();
        let next = CronEvaluator::next_run("*/15 * * * *", now).expect("next");
        let local = next.with_timezone(&Local);
        assert_eq!(local.minute() % 15, 0);
        assert_eq!(local.second(), 0);
    }

    #[test]
    fn iterated_next_runs_are_strictly_increasing() {
        let mut at = Utc::now();
        let mut previous = at;
        for _ in 0..5 {
            let next = CronEvaluator::next_run("*/5 * * * *", at).expect("next");
            assert!(next > previous);
            previous = next;
            at = next;
        }
    }
}
