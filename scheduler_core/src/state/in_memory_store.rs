use std::{collections::HashMap, time::{Duration, Instant}};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::SchedulerError;

use super::StateStore;

struct Entry {
    value: String,
    /// `None` when the ttl is too large to represent
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local store with TTL semantics. Survives nothing, but lets the
/// checkpoint/recovery path run without an external service.
#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<(), SchedulerError> {
        let mut entries = self.entries.write().await;
        let expires_at = Instant::now().checked_add(ttl);
        entries.insert(key.to_string(), Entry { value: value.to_string(), expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SchedulerError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.value.clone()))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, SchedulerError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        // expired entries are purged lazily here
        entries.retain(|_, e| e.is_live(now));

        Ok(entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn delete(&self, key: &str) -> Result<(), SchedulerError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_get_delete() {
        let store = InMemoryStore::new();

        store.setex("scheduler:task:1", Duration::from_secs(60), "one").await.expect("Should store the value");
        assert_eq!(store.get("scheduler:task:1").await.unwrap().as_deref(), Some("one"));

        store.delete("scheduler:task:1").await.unwrap();
        assert!(store.get("scheduler:task:1").await.unwrap().is_none(), "deleted key should be gone");
    }

    #[tokio::test]
    async fn keys_filters_by_prefix() {
        let store = InMemoryStore::new();
        store.setex("scheduler:task:a", Duration::from_secs(60), "{}").await.unwrap();
        store.setex("scheduler:task:b", Duration::from_secs(60), "{}").await.unwrap();
        store.setex("scheduler:schedule:c", Duration::from_secs(60), "{}").await.unwrap();

        let mut keys = store.keys("scheduler:task:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["scheduler:task:a", "scheduler:task:b"]);
    }

    #[tokio::test]
    async fn expired_entries_disappear() {
        let store = InMemoryStore::new();
        store.setex("short", Duration::from_millis(10), "x").await.unwrap();
        store.setex("long", Duration::from_secs(60), "y").await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get("short").await.unwrap().is_none(), "ttl should have elapsed");
        assert_eq!(store.keys("").await.unwrap(), vec!["long"]);
    }

    #[tokio::test]
    async fn huge_ttl_never_expires() {
        let store = InMemoryStore::new();
        store.setex("forever", Duration::MAX, "x").await.expect("an unrepresentable ttl must not panic");

        assert_eq!(store.get("forever").await.unwrap().as_deref(), Some("x"));
        assert_eq!(store.keys("").await.unwrap(), vec!["forever"]);
    }

    #[tokio::test]
    async fn concurrent_inserts() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = vec![];

        for i in 0..5 {
            let store_clone = store.clone();

            let handle = tokio::spawn(async move {
                store_clone
                    .setex(&format!("scheduler:task:{}", i), Duration::from_secs(60), "{}")
                    .await
                    .expect("Value should have been stored");
            });

            handles.push(handle);
        }

        for handle in handles {
            handle.await.expect("Should join all the async tasks");
        }

        assert_eq!(store.keys("scheduler:task:").await.unwrap().len(), 5, "5 entries should be stored");
    }
}
