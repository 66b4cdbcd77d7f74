//! Cron evaluation behind a narrow interface, so the parsing library and the
//! fallback policy can change independently of the scheduler loop.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use croner::Cron;
use tracing::warn;

use crate::error::{SchedulerError, SchedulerResult};

/// Delay used when an expression cannot be evaluated.
pub const FALLBACK_DELAY_HOURS: i64 = 1;

pub trait CronCalculator: Send + Sync {
    /// First fire time strictly after `after`.
    fn next_run_time(&self, expr: &str, after: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>>;
}

/// 5-field (minute hour day month weekday) expressions evaluated in UTC with `croner`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CronerCalculator;

impl CronCalculator for CronerCalculator {
    fn next_run_time(&self, expr: &str, after: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>> {
        let fields = expr.split_whitespace().count();
        if fields != 5 {
            return Err(SchedulerError::InvalidCron {
                expr: expr.to_string(),
                message: format!("expected 5 fields, found {}", fields),
            });
        }

        let cron = Cron::from_str(expr).map_err(|e| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;

        cron.find_next_occurrence(&after, false)
            .map_err(|e| SchedulerError::InvalidCron {
                expr: expr.to_string(),
                message: e.to_string(),
            })
    }
}

/// Never fails: an unusable expression degrades to `now + 1h` and is logged.
pub fn next_run_or_fallback(
    calculator: &dyn CronCalculator,
    expr: &str,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match calculator.next_run_time(expr, now) {
        Ok(next) => next,
        Err(e) => {
            warn!("cron evaluation failed, retrying in {}h: {}", FALLBACK_DELAY_HOURS, e);
            now + Duration::hours(FALLBACK_DELAY_HOURS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn every_five_minutes() {
        let calc = CronerCalculator;
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 2, 30).unwrap();

        let next = calc.next_run_time("*/5 * * * *", after).expect("valid expression");
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn next_is_strictly_after_reference() {
        let calc = CronerCalculator;
        let on_the_mark = Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap();

        let next = calc.next_run_time("*/5 * * * *", on_the_mark).expect("valid expression");
        assert!(next > on_the_mark, "next run must be in the future");
        assert_eq!(next.minute(), 10);
    }

    #[test]
    fn daily_expression() {
        let calc = CronerCalculator;
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        let next = calc.next_run_time("30 2 * * *", after).expect("valid expression");
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 2, 2, 30, 0).unwrap());
    }

    #[test]
    fn rejects_malformed_expressions() {
        let calc = CronerCalculator;
        let now = Utc::now();
        assert!(matches!(calc.next_run_time("not a cron", now), Err(SchedulerError::InvalidCron { .. })));
        assert!(calc.next_run_time("* * * *", now).is_err(), "four fields should be rejected");
        assert!(calc.next_run_time("61 * * * *", now).is_err(), "minute out of range");
    }

    #[test]
    fn fallback_is_one_hour() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let next = next_run_or_fallback(&CronerCalculator, "garbage", now);
        assert_eq!(next, now + Duration::hours(1));
    }
}
