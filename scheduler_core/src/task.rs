use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type TaskId = String;
pub type ScheduleId = String;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// metadata key that links a spawned task back to its schedule
pub const FROM_SCHEDULE: &str = "from_schedule";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Immediate,
    Delayed,
    Scheduled,
    Recurring,
    Conditional,
}

/// Lower value is more urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
}

impl TaskPriority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Record label only. The engine never holds a task in this state: a
    /// failed attempt goes straight back to PENDING as a delayed task. A stored
    /// record carrying it is re-queued as PENDING on recovery.
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    pub max_retries: u32,
    pub retry_count: u32,
    /// seconds
    pub timeout: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Task {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// The schedule this task was spawned from, if any.
    pub fn schedule_id(&self) -> Option<&str> {
        self.metadata.get(FROM_SCHEDULE).and_then(Value::as_str)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_time.map_or(true, |t| t <= now)
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
    }

    pub fn mark_completed(&mut self, result: Value, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.result = None;
        self.completed_at = Some(now);
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(now);
    }

    /// Re-home a failed attempt as a delayed task due at `scheduled_time`.
    pub fn requeue_for_retry(&mut self, error: impl Into<String>, scheduled_time: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.task_type = TaskType::Delayed;
        self.scheduled_time = Some(scheduled_time);
        self.error = Some(error.into());
        self.started_at = None;
    }

    pub fn from_schedule(schedule: &Schedule, now: DateTime<Utc>) -> Self {
        let mut metadata = Map::new();
        metadata.insert(FROM_SCHEDULE.to_string(), Value::String(schedule.schedule_id.clone()));

        Task {
            task_id: Uuid::new_v4().to_string(),
            name: schedule.task_name.clone(),
            task_type: TaskType::Immediate,
            function_name: schedule.function_name.clone(),
            args: schedule.args.clone(),
            kwargs: schedule.kwargs.clone(),
            priority: schedule.priority,
            status: TaskStatus::Pending,
            scheduled_time: None,
            cron_expression: Some(schedule.cron_expression.clone()),
            depends_on: Vec::new(),
            max_retries: schedule.max_retries,
            retry_count: 0,
            timeout: schedule.timeout,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            metadata,
        }
    }
}

/// A recurring definition. Never executed itself, it spawns a `Task` each time it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: ScheduleId,
    pub name: String,
    pub task_name: String,
    pub cron_expression: String,
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    pub enabled: bool,
    pub next_run_time: DateTime<Utc>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Schedule {
    /// `next_run_time` is filled in by the scheduler when the schedule is added.
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        function_name: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            schedule_id: Uuid::new_v4().to_string(),
            task_name: name.clone(),
            name,
            cron_expression: cron_expression.into(),
            function_name: function_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            priority: TaskPriority::Normal,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT_SECS,
            enabled: true,
            next_run_time: now,
            last_run_time: None,
            created_at: now,
        }
    }

    pub fn with_id(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = schedule_id.into();
        self
    }

    pub fn task_name(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = task_name.into();
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_time <= now
    }
}

/// Submission request. `Scheduler::submit_task` turns it into a `Task` (or a
/// `Schedule` for recurring submissions).
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_id: Option<TaskId>,
    pub name: String,
    pub function_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub max_retries: u32,
    pub timeout: u64,
    pub depends_on: Vec<TaskId>,
    pub metadata: Map<String, Value>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            task_id: None,
            name: name.into(),
            function_name: function_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            task_type: TaskType::Immediate,
            priority: TaskPriority::Normal,
            scheduled_time: None,
            cron_expression: None,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT_SECS,
            depends_on: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Run at an absolute time.
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.task_type = TaskType::Scheduled;
        self.scheduled_time = Some(time);
        self
    }

    /// Run after a relative delay from now. Delays past the representable
    /// range clamp to the latest possible time.
    pub fn delayed_by(mut self, delay: Duration) -> Self {
        self.task_type = TaskType::Delayed;
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.scheduled_time = Some(due);
        self
    }

    pub fn recurring(mut self, cron_expression: impl Into<String>) -> Self {
        self.task_type = TaskType::Recurring;
        self.cron_expression = Some(cron_expression.into());
        self
    }

    /// Gate on other tasks reaching COMPLETED.
    pub fn after(mut self, depends_on: Vec<TaskId>) -> Self {
        self.task_type = TaskType::Conditional;
        self.depends_on = depends_on;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub(crate) fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            task_id: self.task_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            task_type: self.task_type,
            function_name: self.function_name,
            args: self.args,
            kwargs: self.kwargs,
            priority: self.priority,
            status: TaskStatus::Pending,
            scheduled_time: self.scheduled_time,
            cron_expression: self.cron_expression,
            depends_on: self.depends_on,
            max_retries: self.max_retries,
            retry_count: 0,
            timeout: self.timeout,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            metadata: self.metadata,
        }
    }

    pub(crate) fn into_schedule(self, cron_expression: String) -> Schedule {
        let mut schedule = Schedule::new(self.name.clone(), cron_expression, self.function_name)
            .task_name(self.name)
            .args(self.args)
            .kwargs(self.kwargs)
            .priority(self.priority);
        if let Some(id) = self.task_id {
            schedule.schedule_id = id;
        }
        schedule.max_retries = self.max_retries;
        schedule.timeout = self.timeout;
        schedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_by_urgency() {
        assert!(TaskPriority::Critical < TaskPriority::Normal, "critical should sort first");
        assert_eq!(TaskPriority::Low.value(), 4);
    }

    #[test]
    fn persisted_shape_uses_string_enums_and_iso_timestamps() {
        let task = TaskSpec::new("ping", "health_check").into_task(Utc::now());
        let value = serde_json::to_value(&task).expect("task should serialize");

        assert_eq!(value["status"], "pending");
        assert_eq!(value["task_type"], "immediate");
        assert_eq!(value["priority"], "normal");
        let created = value["created_at"].as_str().expect("created_at should be a string");
        assert!(DateTime::parse_from_rfc3339(created).is_ok(), "created_at should be ISO-8601");
    }

    #[test]
    fn spawned_task_carries_schedule_template() {
        let schedule = Schedule::new("cleanup", "*/5 * * * *", "purge")
            .task_name("purge-run")
            .args(vec![serde_json::json!(7)])
            .priority(TaskPriority::High);
        let task = Task::from_schedule(&schedule, Utc::now());

        assert_eq!(task.task_type, TaskType::Immediate);
        assert_eq!(task.name, "purge-run");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.schedule_id(), Some(schedule.schedule_id.as_str()));
        assert_eq!(task.cron_expression.as_deref(), Some("*/5 * * * *"));
    }

    #[test]
    fn huge_delay_clamps_instead_of_overflowing() {
        let spec = TaskSpec::new("someday", "noop").delayed_by(Duration::MAX);
        assert_eq!(spec.task_type, TaskType::Delayed);
        assert_eq!(spec.scheduled_time, Some(DateTime::<Utc>::MAX_UTC));
    }

    #[test]
    fn retry_rehomes_as_delayed() {
        let now = Utc::now();
        let mut task = TaskSpec::new("flaky", "explode").into_task(now);
        task.mark_running(now);
        task.requeue_for_retry("boom", now + chrono::Duration::seconds(2));

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.task_type, TaskType::Delayed);
        assert!(!task.is_due(now), "task should wait for its backoff");
        assert!(task.is_due(now + chrono::Duration::seconds(2)));
    }
}
