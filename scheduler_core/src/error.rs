use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Function not registered: {0}")]
    FunctionNotRegistered(String),

    #[error("Invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },

    #[error("Recurring task {0} requires a cron expression")]
    MissingCronExpression(String),

    #[error("Task {0} requires a scheduled time")]
    MissingScheduledTime(String),

    #[error("Circular dependency detected for task {0}")]
    CircularDependency(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for SchedulerError {
    fn from(e: sqlx::Error) -> Self {
        SchedulerError::Storage(e.to_string())
    }
}

impl From<redis::RedisError> for SchedulerError {
    fn from(e: redis::RedisError) -> Self {
        SchedulerError::Storage(e.to_string())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
