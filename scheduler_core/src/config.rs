use std::{str::FromStr, time::Duration};

use dotenv::dotenv;

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub max_concurrent_tasks: usize,
    /// how long finished tasks stay inspectable before garbage collection
    pub retention: Duration,
    pub shutdown_grace: Duration,
    /// extra sleep after a tick that returned an error
    pub error_backoff: Duration,
    pub task_ttl: Duration,
    pub schedule_ttl: Duration,
    /// deadline for a single checkpoint write
    pub persist_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_concurrent_tasks: 10,
            retention: Duration::from_secs(24 * 60 * 60),
            shutdown_grace: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
            task_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            schedule_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            persist_timeout: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    /// Reads `SCHEDULER_*` variables (a `.env` file is honored), falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> SchedulerResult<Self> {
        dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            tick_interval: env_or("SCHEDULER_TICK_INTERVAL_MS", defaults.tick_interval, Duration::from_millis)?,
            max_concurrent_tasks: env_or("SCHEDULER_MAX_CONCURRENT_TASKS", defaults.max_concurrent_tasks, |v| v)?,
            retention: match env_or("SCHEDULER_RETENTION_HOURS", None, Some::<u64>)? {
                Some(hours) => hours_to_duration("SCHEDULER_RETENTION_HOURS", hours)?,
                None => defaults.retention,
            },
            shutdown_grace: env_or("SCHEDULER_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace, Duration::from_secs)?,
            error_backoff: env_or("SCHEDULER_ERROR_BACKOFF_SECS", defaults.error_backoff, Duration::from_secs)?,
            task_ttl: env_or("SCHEDULER_TASK_TTL_SECS", defaults.task_ttl, Duration::from_secs)?,
            schedule_ttl: env_or("SCHEDULER_SCHEDULE_TTL_SECS", defaults.schedule_ttl, Duration::from_secs)?,
            persist_timeout: env_or("SCHEDULER_PERSIST_TIMEOUT_MS", defaults.persist_timeout, Duration::from_millis)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(SchedulerError::Configuration("max_concurrent_tasks must be at least 1".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(SchedulerError::Configuration("tick_interval must be positive".into()));
        }
        Ok(())
    }
}

fn hours_to_duration(key: &str, hours: u64) -> SchedulerResult<Duration> {
    hours
        .checked_mul(60 * 60)
        .map(Duration::from_secs)
        .ok_or_else(|| SchedulerError::Configuration(format!("{}={} is out of range", key, hours)))
}

fn env_or<T, R, F>(key: &str, default: R, convert: F) -> SchedulerResult<R>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: FnOnce(T) -> R,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(convert)
            .map_err(|e| SchedulerError::Configuration(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.retention, Duration::from_secs(86_400));
        assert_eq!(config.task_ttl.as_secs(), 604_800, "tasks live for 7 days");
        assert_eq!(config.schedule_ttl.as_secs(), 2_592_000, "schedules live for 30 days");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_values_are_parsed_and_bad_values_rejected() {
        std::env::set_var("SCHEDULER_TEST_ONLY_GOOD", "250");
        std::env::set_var("SCHEDULER_TEST_ONLY_BAD", "fast");

        let good = env_or("SCHEDULER_TEST_ONLY_GOOD", Duration::ZERO, Duration::from_millis).unwrap();
        assert_eq!(good, Duration::from_millis(250));

        let bad = env_or("SCHEDULER_TEST_ONLY_BAD", Duration::ZERO, Duration::from_millis);
        assert!(matches!(bad, Err(SchedulerError::Configuration(_))));

        let missing = env_or("SCHEDULER_TEST_ONLY_MISSING", 7usize, |v| v).unwrap();
        assert_eq!(missing, 7);
    }

    #[test]
    fn retention_hours_overflow_is_rejected() {
        assert_eq!(hours_to_duration("RETENTION", 2).unwrap(), Duration::from_secs(7_200));
        assert!(matches!(
            hours_to_duration("RETENTION", u64::MAX),
            Err(SchedulerError::Configuration(_))
        ));
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let config = SchedulerConfig { max_concurrent_tasks: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
