//! The scheduler loop: owns every in-memory table, ticks on a fixed interval,
//! and is the only place task or schedule state changes.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::SchedulerConfig,
    cron::{next_run_or_fallback, CronCalculator, CronerCalculator},
    dependency::{creates_cycle, DependencyResolver},
    error::{SchedulerError, SchedulerResult},
    queue::DispatchQueue,
    registry::{FunctionRegistry, FunctionResult, TaskFunction},
    retry::{RetryDecision, RetryPolicy},
    state::{Checkpointer, StateStore},
    task::{Schedule, ScheduleId, Task, TaskId, TaskSpec, TaskStatus, TaskType},
    worker::{ExecutionOutcome, TaskExecutor, TokioExecutor},
};


#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub schedules_executed: u64,
    /// runnable tasks waiting in the dispatch queue
    pub pending: usize,
    /// delayed and scheduled tasks not yet due
    pub scheduled: usize,
    /// dependency-gated tasks still parked
    pub waiting: usize,
    pub running: usize,
    pub completed: usize,
    pub active_schedules: usize,
    pub total_schedules: usize,
    pub registered_functions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerHealth {
    pub pending: usize,
    pub scheduled: usize,
    pub waiting: usize,
    pub running: usize,
    /// (parked task, dependency) where the dependency ended FAILED or CANCELLED
    pub blocked: Vec<(TaskId, TaskId)>,
    /// (parked task, dependency) where the dependency is unknown
    pub missing_dependencies: Vec<(TaskId, TaskId)>,
}

impl SchedulerHealth {
    pub fn is_healthy(&self) -> bool {
        self.blocked.is_empty() && self.missing_dependencies.is_empty()
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    failed: u64,
    retried: u64,
    schedules_executed: u64,
}

/// All mutable engine state, behind one lock. Tasks live in an arena keyed by
/// id; the queue, delayed table, resolver and running set only hold ids.
#[derive(Default)]
struct EngineState {
    tasks: HashMap<TaskId, Task>,
    queue: DispatchQueue,
    delayed: HashSet<TaskId>,
    dependencies: DependencyResolver,
    running: HashSet<TaskId>,
    finished: HashSet<TaskId>,
    schedules: HashMap<ScheduleId, Schedule>,
    counters: Counters,
}

impl EngineState {
    /// Copy-modify-write through the arena; returns the updated snapshot.
    fn modify<F: FnOnce(&mut Task)>(&mut self, task_id: &str, f: F) -> Option<Task> {
        let task = self.tasks.get_mut(task_id)?;
        f(task);
        Some(task.clone())
    }

    fn is_completed(&self, task_id: &str) -> bool {
        self.tasks.get(task_id).is_some_and(|t| t.status == TaskStatus::Completed)
    }

    /// Place a PENDING task (already in the arena) into the table its type calls for.
    fn route(&mut self, task_id: &str) {
        let Some(task) = self.tasks.get(task_id) else {
            return;
        };

        match task.task_type {
            TaskType::Delayed | TaskType::Scheduled if task.scheduled_time.is_some() => {
                debug!("Task {} scheduled for {:?}", task_id, task.scheduled_time);
                self.delayed.insert(task_id.to_string());
            }
            TaskType::Conditional => {
                let unmet: Vec<TaskId> = task
                    .depends_on
                    .iter()
                    .filter(|dep| !self.is_completed(dep))
                    .cloned()
                    .collect();
                if unmet.is_empty() {
                    let task = task.clone();
                    self.queue.push(&task);
                } else {
                    self.dependencies.park(task_id, unmet);
                }
            }
            _ => {
                let task = task.clone();
                self.queue.push(&task);
            }
        }
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            tasks_processed: self.counters.processed,
            tasks_failed: self.counters.failed,
            tasks_retried: self.counters.retried,
            schedules_executed: self.counters.schedules_executed,
            pending: self.queue.len(),
            scheduled: self.delayed.len(),
            waiting: self.dependencies.len(),
            running: self.running.len(),
            completed: self.finished.len(),
            active_schedules: self.schedules.values().filter(|s| s.enabled).count(),
            total_schedules: self.schedules.len(),
            registered_functions: 0,
        }
    }
}

struct Inner {
    config: SchedulerConfig,
    state: Mutex<EngineState>,
    registry: FunctionRegistry,
    executor: Arc<dyn TaskExecutor>,
    cron: Arc<dyn CronCalculator>,
    retry: RetryPolicy,
    checkpointer: Checkpointer,
    recovered: AtomicBool,
    shutdown: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn StateStore>>,
    executor: Arc<dyn TaskExecutor>,
    cron: Arc<dyn CronCalculator>,
    retry: RetryPolicy,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            store: None,
            executor: Arc::new(TokioExecutor),
            cron: Arc::new(CronerCalculator),
            retry: RetryPolicy::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn cron_calculator(mut self, cron: Arc<dyn CronCalculator>) -> Self {
        self.cron = cron;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Scheduler {
        let (shutdown, _) = watch::channel(false);
        let checkpointer = Checkpointer::new(self.store, &self.config);
        Scheduler {
            inner: Arc::new(Inner {
                config: self.config,
                state: Mutex::new(EngineState::default()),
                registry: FunctionRegistry::new(),
                executor: self.executor,
                cron: self.cron,
                retry: self.retry,
                checkpointer,
                recovered: AtomicBool::new(false),
                shutdown,
                loop_handle: Mutex::new(None),
            }),
        }
    }
}

/// Handle to the engine. Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    pub fn new(config: SchedulerConfig, store: Option<Arc<dyn StateStore>>) -> Self {
        let builder = SchedulerBuilder::new(config);
        match store {
            Some(store) => builder.store(store).build(),
            None => builder.build(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    // ===== function registry =====

    pub async fn register_function(&self, name: impl Into<String>, function: Arc<dyn TaskFunction>) {
        self.inner.registry.register(name, function).await;
    }

    pub async fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<serde_json::Value>, serde_json::Map<String, serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = FunctionResult> + Send + 'static,
    {
        self.inner.registry.register_fn(name, f).await;
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.inner.registry.contains(name).await
    }

    // ===== submission =====

    /// Accept a unit of work. Recurring submissions become a `Schedule` and
    /// the schedule id is returned.
    pub async fn submit_task(&self, spec: TaskSpec) -> SchedulerResult<TaskId> {
        if !self.inner.registry.contains(&spec.function_name).await {
            return Err(SchedulerError::FunctionNotRegistered(spec.function_name));
        }

        match spec.task_type {
            TaskType::Recurring => {
                let expr = spec
                    .cron_expression
                    .clone()
                    .ok_or_else(|| SchedulerError::MissingCronExpression(spec.name.clone()))?;
                let schedule = spec.into_schedule(expr);
                return self.add_schedule(schedule).await;
            }
            TaskType::Delayed | TaskType::Scheduled if spec.scheduled_time.is_none() => {
                return Err(SchedulerError::MissingScheduledTime(spec.name));
            }
            _ => {}
        }

        let task = spec.into_task(Utc::now());
        let task_id = task.task_id.clone();

        let snapshot = {
            let mut state = self.inner.state.lock().await;

            if state.tasks.contains_key(&task_id) {
                info!("Task {} already submitted, ignoring duplicate", task_id);
                return Ok(task_id);
            }

            if task.task_type == TaskType::Conditional
                && creates_cycle(&task_id, &task.depends_on, |id| {
                    state.tasks.get(id).map(|t| t.depends_on.clone()).unwrap_or_default()
                })
            {
                return Err(SchedulerError::CircularDependency(task_id));
            }

            info!(
                "Submitted task {} ({}) type={:?} priority={:?}",
                task_id, task.name, task.task_type, task.priority
            );
            state.tasks.insert(task_id.clone(), task.clone());
            state.route(&task_id);
            (task, self.inner.checkpointer.stamp())
        };

        self.inner.checkpointer.save_task(&snapshot.0, snapshot.1).await;
        Ok(task_id)
    }

    pub async fn add_schedule(&self, mut schedule: Schedule) -> SchedulerResult<ScheduleId> {
        if !self.inner.registry.contains(&schedule.function_name).await {
            return Err(SchedulerError::FunctionNotRegistered(schedule.function_name));
        }

        let now = Utc::now();
        schedule.next_run_time = self.inner.cron.next_run_time(&schedule.cron_expression, now)?;
        let schedule_id = schedule.schedule_id.clone();

        let version = {
            let mut state = self.inner.state.lock().await;
            if state.schedules.insert(schedule_id.clone(), schedule.clone()).is_some() {
                info!("Replaced schedule {}", schedule_id);
            }
            self.inner.checkpointer.stamp()
        };
        info!(
            "Added schedule {} ({}) '{}', next run at {}",
            schedule_id, schedule.name, schedule.cron_expression, schedule.next_run_time
        );

        self.inner.checkpointer.save_schedule(&schedule, version).await;
        Ok(schedule_id)
    }

    pub async fn remove_schedule(&self, schedule_id: &str) -> bool {
        let version = {
            let mut state = self.inner.state.lock().await;
            if state.schedules.remove(schedule_id).is_none() {
                return false;
            }
            self.inner.checkpointer.stamp()
        };
        info!("Removed schedule {}", schedule_id);
        self.inner.checkpointer.delete_schedule(schedule_id, version).await;
        true
    }

    /// Re-enabling computes a fresh `next_run_time` so slots missed while
    /// disabled are not fired.
    pub async fn set_schedule_enabled(&self, schedule_id: &str, enabled: bool) -> bool {
        let snapshot = {
            let mut state = self.inner.state.lock().await;
            let Some(schedule) = state.schedules.get_mut(schedule_id) else {
                return false;
            };
            if enabled && !schedule.enabled {
                schedule.next_run_time =
                    next_run_or_fallback(self.inner.cron.as_ref(), &schedule.cron_expression, Utc::now());
            }
            schedule.enabled = enabled;
            (schedule.clone(), self.inner.checkpointer.stamp())
        };
        info!("Schedule {} enabled={}", schedule_id, enabled);
        self.inner.checkpointer.save_schedule(&snapshot.0, snapshot.1).await;
        true
    }

    /// Pending tasks are withdrawn from every table. Running tasks are only
    /// marked: the executor is left to finish and its result is discarded.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let now = Utc::now();
        let snapshot = {
            let mut state = self.inner.state.lock().await;
            let Some(status) = state.tasks.get(task_id).map(|t| t.status) else {
                return false;
            };

            match status {
                TaskStatus::Pending => {
                    state.queue.remove(task_id);
                    state.delayed.remove(task_id);
                    state.dependencies.remove(task_id);
                    state.finished.insert(task_id.to_string());
                    info!("Cancelled pending task {}", task_id);
                }
                TaskStatus::Running => {
                    warn!("Task {} is running, cancellation is advisory only", task_id);
                }
                _ => return false,
            }
            state
                .modify(task_id, |t| t.mark_cancelled(now))
                .map(|task| (task, self.inner.checkpointer.stamp()))
        };

        if let Some((task, version)) = snapshot {
            self.inner.checkpointer.save_task(&task, version).await;
        }
        true
    }

    // ===== inspection =====

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.inner.state.lock().await.tasks.get(task_id).cloned()
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Option<Schedule> {
        self.inner.state.lock().await.schedules.get(schedule_id).cloned()
    }

    pub async fn list_schedules(&self) -> Vec<Schedule> {
        let state = self.inner.state.lock().await;
        let mut schedules: Vec<Schedule> = state.schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.next_run_time.cmp(&b.next_run_time));
        schedules
    }

    pub async fn get_stats(&self) -> SchedulerStats {
        let mut stats = self.inner.state.lock().await.stats();
        stats.registered_functions = self.inner.registry.len().await;
        stats
    }

    pub async fn health(&self) -> SchedulerHealth {
        let state = self.inner.state.lock().await;
        let mut blocked = Vec::new();
        let mut missing_dependencies = Vec::new();

        for (task_id, unmet) in state.dependencies.parked() {
            for dep in unmet {
                match state.tasks.get(dep).map(|t| t.status) {
                    Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) => {
                        blocked.push((task_id.clone(), dep.clone()));
                    }
                    None => missing_dependencies.push((task_id.clone(), dep.clone())),
                    _ => {}
                }
            }
        }
        blocked.sort();
        missing_dependencies.sort();

        SchedulerHealth {
            pending: state.queue.len(),
            scheduled: state.delayed.len(),
            waiting: state.dependencies.len(),
            running: state.running.len(),
            blocked,
            missing_dependencies,
        }
    }

    // ===== lifecycle =====

    /// Restore state from the store, then start ticking. Recovery failures
    /// are logged and the engine continues with whatever was loaded.
    pub async fn start(&self) -> SchedulerResult<()> {
        let mut handle = self.inner.loop_handle.lock().await;
        if handle.is_some() {
            return Err(SchedulerError::Internal("scheduler already started".into()));
        }

        if let Err(e) = self.recover().await {
            error!("Recovery failed, continuing without persisted state: {}", e);
        }

        self.inner.shutdown.send_replace(false);
        let scheduler = self.clone();
        *handle = Some(tokio::spawn(async move { scheduler.run().await }));
        info!(
            "Scheduler started (tick={:?}, max_concurrent_tasks={})",
            self.inner.config.tick_interval, self.inner.config.max_concurrent_tasks
        );
        Ok(())
    }

    /// Stop ticking immediately, then wait up to the grace period for
    /// running tasks to settle. Stragglers are no longer tracked.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        if let Some(handle) = self.inner.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Scheduler loop ended abnormally: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_grace;
        loop {
            let running = self.inner.state.lock().await.running.len();
            if running == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "{} task(s) still running after {:?}, no longer tracking them",
                    running, self.inner.config.shutdown_grace
                );
                self.inner.state.lock().await.running.clear();
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("Scheduler stopped");
    }

    async fn run(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }

            // each tick runs as its own tokio task so a panic is contained
            let scheduler = self.clone();
            let outcome = tokio::spawn(async move { scheduler.tick_at(Utc::now()).await }).await;

            let mut pause = self.inner.config.tick_interval;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Scheduler tick failed: {}", e);
                    pause += self.inner.config.error_backoff;
                }
                Err(e) => {
                    error!("Scheduler tick panicked: {}", e);
                    pause += self.inner.config.error_backoff;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => {}
            }
        }
        debug!("Scheduler loop exited");
    }

    /// One pass of the loop body, evaluated at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.dispatch_ready(now).await?;
        self.promote_due(now).await;
        self.fire_schedules(now).await;
        self.collect_garbage(now).await;

        let stats = self.inner.state.lock().await.stats();
        metrics::gauge!("scheduler_running_tasks", stats.running as f64);
        metrics::gauge!("scheduler_pending_tasks", stats.pending as f64);
        Ok(())
    }

    /// Drain the queue in priority order until it is empty or the running
    /// set reaches the concurrency ceiling.
    async fn dispatch_ready(&self, now: DateTime<Utc>) -> SchedulerResult<()> {
        let mut checkpoints = Vec::new();
        let mut launches = Vec::new();

        {
            let mut state = self.inner.state.lock().await;
            while state.running.len() < self.inner.config.max_concurrent_tasks {
                let Some(task_id) = state.queue.pop() else {
                    break;
                };
                let Some(function_name) = state
                    .tasks
                    .get(&task_id)
                    .filter(|t| t.status == TaskStatus::Pending)
                    .map(|t| t.function_name.clone())
                else {
                    debug!("Skipping stale queue entry {}", task_id);
                    continue;
                };

                let Some(function) = self.inner.registry.get(&function_name).await else {
                    let error = SchedulerError::FunctionNotRegistered(function_name).to_string();
                    error!("Task {} failed without retry: {}", task_id, error);
                    if let Some(task) = state.modify(&task_id, |t| t.mark_failed(error, now)) {
                        checkpoints.push((task, self.inner.checkpointer.stamp()));
                    }
                    state.finished.insert(task_id);
                    state.counters.failed += 1;
                    metrics::increment_counter!("scheduler_tasks_failed_total");
                    continue;
                };

                let Some(task) = state.modify(&task_id, |t| t.mark_running(now)) else {
                    continue;
                };
                state.running.insert(task_id);
                debug!("Dispatching task {} ({})", task.task_id, task.name);
                checkpoints.push((task.clone(), self.inner.checkpointer.stamp()));
                launches.push((task, function));
            }
        }

        for (task, version) in &checkpoints {
            self.inner.checkpointer.save_task(task, *version).await;
        }
        for (task, function) in launches {
            self.spawn_execution(task, function);
        }
        Ok(())
    }

    fn spawn_execution(&self, task: Task, function: Arc<dyn TaskFunction>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let outcome = scheduler
                .inner
                .executor
                .execute(function, task.args.clone(), task.kwargs.clone(), task.timeout_duration())
                .await;
            scheduler.complete(&task.task_id, outcome, Utc::now()).await;
        });
    }

    /// Completion handler: record the outcome, retry or fail, and release dependents.
    async fn complete(&self, task_id: &str, outcome: ExecutionOutcome, now: DateTime<Utc>) {
        let snapshot = {
            let mut state = self.inner.state.lock().await;
            if !state.running.remove(task_id) {
                debug!("Ignoring result for untracked task {}", task_id);
                return;
            }
            let Some(status) = state.tasks.get(task_id).map(|t| t.status) else {
                return;
            };
            if status != TaskStatus::Running {
                info!("Discarding result of task {} (status {:?})", task_id, status);
                if status.is_terminal() {
                    state.finished.insert(task_id.to_string());
                }
                return;
            }

            let snapshot = match outcome {
                ExecutionOutcome::Success(result) => {
                    let snapshot = state.modify(task_id, |t| t.mark_completed(result, now));
                    state.finished.insert(task_id.to_string());
                    state.counters.processed += 1;
                    metrics::increment_counter!("scheduler_tasks_processed_total");
                    info!("Task {} completed", task_id);

                    for released in state.dependencies.on_completed(task_id) {
                        if state.tasks.get(&released).is_some_and(|t| t.status == TaskStatus::Pending) {
                            state.route(&released);
                        }
                    }
                    snapshot
                }
                ExecutionOutcome::Failure(error) => {
                    let (retry_count, max_retries) = match state.tasks.get(task_id) {
                        Some(t) => (t.retry_count, t.max_retries),
                        None => return,
                    };

                    match self.inner.retry.decide(retry_count, max_retries) {
                        RetryDecision::Retry { retry_count, delay } => {
                            let due = now + to_chrono(delay);
                            let snapshot = state.modify(task_id, |t| {
                                t.retry_count = retry_count;
                                t.requeue_for_retry(error.as_str(), due);
                            });
                            state.delayed.insert(task_id.to_string());
                            state.counters.retried += 1;
                            metrics::increment_counter!("scheduler_tasks_retried_total");
                            warn!(
                                "Task {} failed (attempt {}/{}), retrying in {:?}: {}",
                                task_id,
                                retry_count,
                                max_retries + 1,
                                delay,
                                error
                            );
                            snapshot
                        }
                        RetryDecision::Fail => {
                            let snapshot = state.modify(task_id, |t| t.mark_failed(error.as_str(), now));
                            state.finished.insert(task_id.to_string());
                            state.counters.failed += 1;
                            metrics::increment_counter!("scheduler_tasks_failed_total");
                            error!("Task {} failed after {} retries: {}", task_id, retry_count, error);
                            snapshot
                        }
                    }
                }
            };
            snapshot.map(|task| (task, self.inner.checkpointer.stamp()))
        };

        if let Some((task, version)) = snapshot {
            self.inner.checkpointer.save_task(&task, version).await;
        }
    }

    /// Move delayed and scheduled tasks whose time has come onto the queue.
    async fn promote_due(&self, now: DateTime<Utc>) {
        let mut state = self.inner.state.lock().await;
        let due: Vec<TaskId> = state
            .delayed
            .iter()
            .filter(|id| state.tasks.get(*id).map_or(true, |t| t.is_due(now) || t.status != TaskStatus::Pending))
            .cloned()
            .collect();

        for task_id in due {
            state.delayed.remove(&task_id);
            if let Some(task) = state.tasks.get(&task_id).filter(|t| t.status == TaskStatus::Pending) {
                debug!("Task {} is due, queueing", task_id);
                let task = task.clone();
                state.queue.push(&task);
            }
        }
    }

    /// Spawn one task per due, enabled schedule and advance its next run.
    async fn fire_schedules(&self, now: DateTime<Utc>) {
        let mut fired = Vec::new();

        {
            let mut state = self.inner.state.lock().await;
            let due: Vec<ScheduleId> = state
                .schedules
                .values()
                .filter(|s| s.is_due(now))
                .map(|s| s.schedule_id.clone())
                .collect();

            for schedule_id in due {
                let Some(schedule) = state.schedules.get_mut(&schedule_id) else {
                    continue;
                };
                let task = Task::from_schedule(schedule, now);
                schedule.last_run_time = Some(now);
                schedule.next_run_time =
                    next_run_or_fallback(self.inner.cron.as_ref(), &schedule.cron_expression, now);
                info!(
                    "Schedule {} fired task {}, next run at {}",
                    schedule_id, task.task_id, schedule.next_run_time
                );
                let schedule = schedule.clone();

                state.counters.schedules_executed += 1;
                metrics::increment_counter!("scheduler_schedules_executed_total");
                state.tasks.insert(task.task_id.clone(), task.clone());
                state.queue.push(&task);
                fired.push((
                    (schedule, self.inner.checkpointer.stamp()),
                    (task, self.inner.checkpointer.stamp()),
                ));
            }
        }

        for ((schedule, schedule_version), (task, task_version)) in &fired {
            self.inner.checkpointer.save_schedule(schedule, *schedule_version).await;
            self.inner.checkpointer.save_task(task, *task_version).await;
        }
    }

    /// Evict finished tasks older than the retention window from memory and the store.
    async fn collect_garbage(&self, now: DateTime<Utc>) {
        let retention = to_chrono(self.inner.config.retention);
        let expired: Vec<(TaskId, u64)> = {
            let mut state = self.inner.state.lock().await;
            let expired: Vec<TaskId> = state
                .finished
                .iter()
                .filter(|id| {
                    state
                        .tasks
                        .get(*id)
                        .and_then(|t| t.completed_at)
                        .map_or(true, |at| at.checked_add_signed(retention).is_some_and(|expiry| expiry <= now))
                })
                .cloned()
                .collect();

            for task_id in &expired {
                state.finished.remove(task_id);
                state.tasks.remove(task_id);
            }
            expired
                .into_iter()
                .map(|task_id| (task_id, self.inner.checkpointer.stamp()))
                .collect()
        };

        if !expired.is_empty() {
            debug!("Evicted {} finished task(s)", expired.len());
        }
        for (task_id, version) in &expired {
            self.inner.checkpointer.delete_task(task_id, *version).await;
        }
    }

    /// Rebuild the in-memory tables from the store. Pending work is re-queued,
    /// finished tasks are kept for inspection, schedules come back verbatim.
    ///
    /// Runs at most once per engine. Records whose id is already live in memory
    /// are skipped, memory being newer than any checkpoint of it.
    pub async fn recover(&self) -> SchedulerResult<(usize, usize)> {
        if !self.inner.checkpointer.is_durable() || self.inner.recovered.swap(true, Ordering::SeqCst) {
            return Ok((0, 0));
        }

        let loaded = async {
            let tasks = self.inner.checkpointer.load_tasks().await?;
            let schedules = self.inner.checkpointer.load_schedules().await?;
            SchedulerResult::Ok((tasks, schedules))
        }
        .await;
        let (mut tasks, schedules) = match loaded {
            Ok(records) => records,
            Err(e) => {
                // allow a later retry
                self.inner.recovered.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut interrupted = Vec::new();
        let counts = {
            let mut state = self.inner.state.lock().await;

            let mut schedule_count = 0;
            for schedule in schedules {
                if state.schedules.contains_key(&schedule.schedule_id) {
                    continue;
                }
                state.schedules.insert(schedule.schedule_id.clone(), schedule);
                schedule_count += 1;
            }

            // the whole arena is loaded first so dependency checks see finished tasks
            let mut pending = Vec::new();
            let mut loaded = 0;
            for task in tasks {
                if state.tasks.contains_key(&task.task_id) {
                    debug!("Task {} is already live, skipping stored record", task.task_id);
                    continue;
                }
                let task_id = task.task_id.clone();
                if task.status.is_terminal() {
                    state.finished.insert(task_id.clone());
                } else {
                    pending.push((task_id.clone(), task.status));
                }
                state.tasks.insert(task_id, task);
                loaded += 1;
            }

            for (task_id, status) in pending {
                if status != TaskStatus::Pending {
                    warn!("Task {} was {:?} at shutdown, re-queueing", task_id, status);
                    if let Some(task) = state.modify(&task_id, |t| {
                        t.status = TaskStatus::Pending;
                        t.started_at = None;
                    }) {
                        interrupted.push((task, self.inner.checkpointer.stamp()));
                    }
                }
                state.route(&task_id);
            }
            (loaded, schedule_count)
        };

        for (task, version) in &interrupted {
            self.inner.checkpointer.save_task(task, *version).await;
        }
        info!("Recovered {} task(s) and {} schedule(s)", counts.0, counts.1);
        Ok(counts)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}
