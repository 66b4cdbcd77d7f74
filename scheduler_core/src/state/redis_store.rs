use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::error::SchedulerError;

use super::StateStore;

/// Redis-backed store; TTLs map directly onto `SETEX`.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn new(redis_url: Option<&str>) -> Result<Self, SchedulerError> {
        dotenv::dotenv().ok();

        let redis_url = match redis_url {
            Some(url) => url.to_string(),
            None => std::env::var("REDIS_URL")
                .map_err(|_| SchedulerError::Configuration("REDIS_URL must be set".into()))?,
        };

        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_connection_manager().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!("Connected to Redis state store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<(), SchedulerError> {
        let mut conn = self.conn.clone();
        // SETEX rejects a zero ttl
        let secs = ttl.as_secs().max(1);
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(secs)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SchedulerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, SchedulerError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{}*", prefix))
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), SchedulerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}
