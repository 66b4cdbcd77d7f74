use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

use crate::{
    config::SchedulerConfig,
    error::{SchedulerError, SchedulerResult},
    task::{Schedule, Task},
};

pub mod in_memory_store;
pub mod postgres;
pub mod redis_store;

pub use in_memory_store::InMemoryStore;
pub use postgres::PostgresStore;
pub use redis_store::RedisStore;

pub const TASK_PREFIX: &str = "scheduler:task:";
pub const SCHEDULE_PREFIX: &str = "scheduler:schedule:";

/// The durable key-value store the engine checkpoints into.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<(), SchedulerError>;
    async fn get(&self, key: &str) -> Result<Option<String>, SchedulerError>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, SchedulerError>;
    async fn delete(&self, key: &str) -> Result<(), SchedulerError>;
}

pub fn task_key(task_id: &str) -> String {
    format!("{}{}", TASK_PREFIX, task_id)
}

pub fn schedule_key(schedule_id: &str) -> String {
    format!("{}{}", SCHEDULE_PREFIX, schedule_id)
}

/// Serializes entities into the store. Writes never fail the caller: a
/// missing store means memory-only mode, and a failed or slow write is
/// logged and dropped (the next checkpoint of the same key supersedes it).
///
/// Every snapshot carries a version from `stamp()`, taken while the engine
/// lock is held. Writes to one key are serialized and a snapshot older than
/// the last one written for that key is skipped, so a slow stale write can
/// never land on top of a newer one.
pub struct Checkpointer {
    store: Option<Arc<dyn StateStore>>,
    task_ttl: Duration,
    schedule_ttl: Duration,
    write_timeout: Duration,
    versions: AtomicU64,
    /// stamped snapshots not yet written or skipped
    in_flight: AtomicU64,
    written: Mutex<HashMap<String, Arc<Mutex<u64>>>>,
    /// deleted keys whose version slot is kept until nothing stale can still arrive
    tombstones: Mutex<HashSet<String>>,
}

impl Checkpointer {
    pub fn new(store: Option<Arc<dyn StateStore>>, config: &SchedulerConfig) -> Self {
        if store.is_none() {
            warn!("No state store configured, running memory-only (no crash recovery)");
        }
        Self {
            store,
            task_ttl: config.task_ttl,
            schedule_ttl: config.schedule_ttl,
            write_timeout: config.persist_timeout,
            versions: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            written: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    /// Next snapshot version. Call while holding the lock the snapshot was read under.
    pub fn stamp(&self) -> u64 {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn save_task(&self, task: &Task, version: u64) {
        self.save(&task_key(&task.task_id), task, self.task_ttl, version).await;
    }

    pub async fn save_schedule(&self, schedule: &Schedule, version: u64) {
        self.save(&schedule_key(&schedule.schedule_id), schedule, self.schedule_ttl, version).await;
    }

    pub async fn delete_task(&self, task_id: &str, version: u64) {
        self.delete(&task_key(task_id), version).await;
    }

    pub async fn delete_schedule(&self, schedule_id: &str, version: u64) {
        self.delete(&schedule_key(schedule_id), version).await;
    }

    pub async fn load_tasks(&self) -> SchedulerResult<Vec<Task>> {
        self.load_all(TASK_PREFIX).await
    }

    pub async fn load_schedules(&self) -> SchedulerResult<Vec<Schedule>> {
        self.load_all(SCHEDULE_PREFIX).await
    }

    async fn save<T: Serialize>(&self, key: &str, entity: &T, ttl: Duration, version: u64) {
        if let Some(store) = &self.store {
            match serde_json::to_string(entity) {
                Ok(blob) => {
                    if let Some(_slot) = self.claim(key, version).await {
                        self.guarded("setex", key, store.setex(key, ttl, &blob)).await;
                    }
                }
                Err(e) => error!("Failed to serialize {}: {}", key, e),
            }
        }
        self.settle().await;
    }

    async fn delete(&self, key: &str, version: u64) {
        if let Some(store) = &self.store {
            if let Some(_slot) = self.claim(key, version).await {
                self.guarded("delete", key, store.delete(key)).await;
                self.tombstones.lock().await.insert(key.to_string());
            }
        }
        self.settle().await;
    }

    /// Record `version` as the latest for `key`, or refuse if a newer one was
    /// already written. The returned guard must be held for the write so
    /// writes to one key never overlap.
    async fn claim(&self, key: &str, version: u64) -> Option<OwnedMutexGuard<u64>> {
        let slot = self.written.lock().await.entry(key.to_string()).or_default().clone();
        let mut last = slot.lock_owned().await;
        if version <= *last {
            debug!("Skipping stale checkpoint of {} (v{} <= v{})", key, version, *last);
            return None;
        }
        *last = version;
        Some(last)
    }

    async fn settle(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous != Ok(1) {
            return;
        }
        // nothing stamped is outstanding, so deleted keys can forget their versions
        let mut tombstones = self.tombstones.lock().await;
        if !tombstones.is_empty() {
            let mut written = self.written.lock().await;
            for key in tombstones.drain() {
                written.remove(&key);
            }
        }
    }

    async fn guarded<F>(&self, op: &str, key: &str, fut: F)
    where
        F: Future<Output = SchedulerResult<()>>,
    {
        match tokio::time::timeout(self.write_timeout, fut).await {
            Ok(Ok(())) => debug!("{} {}", op, key),
            Ok(Err(e)) => error!("State store {} failed for {}: {}", op, key, e),
            Err(_) => warn!(
                "State store {} for {} exceeded {:?}, checkpoint dropped",
                op, key, self.write_timeout
            ),
        }
    }

    /// Entries that fail to decode are skipped so one bad record cannot block startup.
    async fn load_all<T: DeserializeOwned>(&self, prefix: &str) -> SchedulerResult<Vec<T>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };

        let mut entities = Vec::new();
        for key in store.keys(prefix).await? {
            let Some(blob) = store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<T>(&blob) {
                Ok(entity) => entities.push(entity),
                Err(e) => warn!("Skipping undecodable record {}: {}", key, e),
            }
        }
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskSpec, TaskStatus};
    use chrono::Utc;

    struct SlowStore;

    #[async_trait]
    impl StateStore for SlowStore {
        async fn setex(&self, _key: &str, _ttl: Duration, _value: &str) -> Result<(), SchedulerError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
        async fn get(&self, _key: &str) -> Result<Option<String>, SchedulerError> {
            Ok(None)
        }
        async fn keys(&self, _prefix: &str) -> Result<Vec<String>, SchedulerError> {
            Err(SchedulerError::Storage("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), SchedulerError> {
            Ok(())
        }
    }

    /// Delays writes of RUNNING snapshots so a later write can overtake them.
    struct LaggyStore {
        inner: InMemoryStore,
        lag: Duration,
    }

    #[async_trait]
    impl StateStore for LaggyStore {
        async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<(), SchedulerError> {
            if value.contains("\"status\":\"running\"") {
                tokio::time::sleep(self.lag).await;
            }
            self.inner.setex(key, ttl, value).await
        }
        async fn get(&self, key: &str) -> Result<Option<String>, SchedulerError> {
            self.inner.get(key).await
        }
        async fn keys(&self, prefix: &str) -> Result<Vec<String>, SchedulerError> {
            self.inner.keys(prefix).await
        }
        async fn delete(&self, key: &str) -> Result<(), SchedulerError> {
            self.inner.delete(key).await
        }
    }

    fn running_then_cancelled() -> (Task, Task) {
        let now = Utc::now();
        let mut running = TaskSpec::new("report", "build_report").with_id("report").into_task(now);
        running.mark_running(now);
        let mut cancelled = running.clone();
        cancelled.mark_cancelled(now);
        (running, cancelled)
    }

    #[tokio::test]
    async fn round_trips_tasks_and_schedules() {
        let store = Arc::new(InMemoryStore::new());
        let checkpointer = Checkpointer::new(Some(store.clone() as Arc<dyn StateStore>), &SchedulerConfig::default());

        let task = TaskSpec::new("report", "build_report").into_task(Utc::now());
        let schedule = Schedule::new("nightly", "0 3 * * *", "build_report");
        checkpointer.save_task(&task, checkpointer.stamp()).await;
        checkpointer.save_schedule(&schedule, checkpointer.stamp()).await;

        assert!(store.get(&task_key(&task.task_id)).await.unwrap().is_some());
        assert_eq!(checkpointer.load_tasks().await.unwrap(), vec![task.clone()]);
        assert_eq!(checkpointer.load_schedules().await.unwrap(), vec![schedule.clone()]);

        checkpointer.delete_task(&task.task_id, checkpointer.stamp()).await;
        assert!(checkpointer.load_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_records_are_skipped() {
        let store = Arc::new(InMemoryStore::new());
        store.setex("scheduler:task:broken", Duration::from_secs(60), "{not json").await.unwrap();
        let checkpointer = Checkpointer::new(Some(store as Arc<dyn StateStore>), &SchedulerConfig::default());

        assert!(checkpointer.load_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_only_mode_is_a_no_op() {
        let checkpointer = Checkpointer::new(None, &SchedulerConfig::default());
        assert!(!checkpointer.is_durable());

        let task = TaskSpec::new("report", "build_report").into_task(Utc::now());
        checkpointer.save_task(&task, checkpointer.stamp()).await;
        assert!(checkpointer.load_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_snapshot_never_overwrites_a_newer_one() {
        let checkpointer =
            Checkpointer::new(Some(Arc::new(InMemoryStore::new()) as Arc<dyn StateStore>), &SchedulerConfig::default());
        let (running, cancelled) = running_then_cancelled();
        let older = checkpointer.stamp();
        let newer = checkpointer.stamp();

        checkpointer.save_task(&cancelled, newer).await;
        checkpointer.save_task(&running, older).await;

        let stored = checkpointer.load_tasks().await.unwrap();
        assert_eq!(stored[0].status, TaskStatus::Cancelled, "older snapshot must be skipped");
    }

    #[tokio::test]
    async fn writes_to_one_key_land_in_version_order() {
        let store = LaggyStore { inner: InMemoryStore::new(), lag: Duration::from_millis(100) };
        let checkpointer = Checkpointer::new(Some(Arc::new(store) as Arc<dyn StateStore>), &SchedulerConfig::default());
        let (running, cancelled) = running_then_cancelled();
        let older = checkpointer.stamp();
        let newer = checkpointer.stamp();

        tokio::join!(checkpointer.save_task(&running, older), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            checkpointer.save_task(&cancelled, newer).await;
        });

        let stored = checkpointer.load_tasks().await.unwrap();
        assert_eq!(stored[0].status, TaskStatus::Cancelled, "the newer write must land last");
    }

    #[tokio::test]
    async fn stale_write_cannot_resurrect_a_deleted_key() {
        let checkpointer =
            Checkpointer::new(Some(Arc::new(InMemoryStore::new()) as Arc<dyn StateStore>), &SchedulerConfig::default());
        let (running, _) = running_then_cancelled();
        let save = checkpointer.stamp();
        let delete = checkpointer.stamp();

        checkpointer.delete_task(&running.task_id, delete).await;
        checkpointer.save_task(&running, save).await;
        assert!(checkpointer.load_tasks().await.unwrap().is_empty());

        // once nothing stale is outstanding the id can be written again
        checkpointer.save_task(&running, checkpointer.stamp()).await;
        assert_eq!(checkpointer.load_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_writes_are_dropped_after_the_deadline() {
        let config = SchedulerConfig { persist_timeout: Duration::from_millis(20), ..Default::default() };
        let checkpointer = Checkpointer::new(Some(Arc::new(SlowStore) as Arc<dyn StateStore>), &config);
        let task = TaskSpec::new("report", "build_report").into_task(Utc::now());

        let started = std::time::Instant::now();
        checkpointer.save_task(&task, checkpointer.stamp()).await;
        assert!(started.elapsed() < Duration::from_secs(5), "write should give up at the deadline");

        assert!(checkpointer.load_tasks().await.is_err(), "load errors surface to the caller");
    }
}
