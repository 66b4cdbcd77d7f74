use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{error::SchedulerError, registry::TaskFunction};

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success(Value),
    Failure(String),
}

/// Runs one task body. Implementations own the timeout: the scheduler never
/// kills an execution itself.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        function: Arc<dyn TaskFunction>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Duration,
    ) -> ExecutionOutcome;
}

/// Executes each call on its own tokio task, so a panicking function is
/// reported as a failure instead of tearing down the scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

#[async_trait]
impl TaskExecutor for TokioExecutor {
    async fn execute(
        &self,
        function: Arc<dyn TaskFunction>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Duration,
    ) -> ExecutionOutcome {
        let handle = tokio::spawn(async move { function.call(args, kwargs).await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(value))) => ExecutionOutcome::Success(value),
            Ok(Ok(Err(e))) => {
                debug!("function returned an error: {}", e);
                ExecutionOutcome::Failure(e.to_string())
            }
            Ok(Err(join_error)) => {
                warn!("function panicked: {}", join_error);
                ExecutionOutcome::Failure(format!("task panicked: {}", join_error))
            }
            Err(_) => {
                abort.abort();
                ExecutionOutcome::Failure(SchedulerError::Timeout(timeout).to_string())
            }
        }
    }
}
