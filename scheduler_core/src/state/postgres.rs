use std::time::Duration;

use async_trait::async_trait;
use dotenv::dotenv;
use sqlx::{migrate::MigrateDatabase, postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::error::SchedulerError;

use super::StateStore;

/// Key-value table in PostgreSQL; expiry is enforced on read.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: Option<&str>) -> Result<PostgresStore, SchedulerError> {
        dotenv().ok();

        let database_url = match database_url {
            Some(url) => url.to_string(),
            None => std::env::var("DATABASE_URL")
                .map_err(|_| SchedulerError::Configuration("DATABASE_URL must be set".into()))?,
        };

        if !sqlx::Postgres::database_exists(&database_url).await? {
            sqlx::Postgres::create_database(&database_url).await?;
        }

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| SchedulerError::Storage(e.to_string()))?;

        info!("Connected to PostgreSQL state store");
        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for PostgresStore {
    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<(), SchedulerError> {
        sqlx::query(
            "INSERT INTO scheduler_kv (key, value, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SchedulerError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM scheduler_kv WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, SchedulerError> {
        sqlx::query("DELETE FROM scheduler_kv WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;

        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM scheduler_kv WHERE left(key, length($1)) = $1",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), SchedulerError> {
        sqlx::query("DELETE FROM scheduler_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
