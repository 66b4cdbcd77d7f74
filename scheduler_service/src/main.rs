use std::{net::SocketAddr, sync::Arc, time::Duration};

use dotenv::dotenv;
use metrics_exporter_prometheus::PrometheusBuilder;
use scheduler_core::{
    registry::FunctionError,
    state::{InMemoryStore, PostgresStore, RedisStore, StateStore},
    Scheduler, SchedulerConfig,
};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn io_error<E>(e: E) -> std::io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

async fn build_store() -> Result<Option<Arc<dyn StateStore>>, std::io::Error> {
    let store_type = std::env::var("SCHEDULER_STORE").unwrap_or_else(|_| "memory".to_string());
    let store = match store_type.as_str() {
        "memory" => Some(Arc::new(InMemoryStore::new()) as Arc<dyn StateStore>),
        "postgres" => Some(Arc::new(PostgresStore::new(None).await.map_err(io_error)?) as Arc<dyn StateStore>),
        "redis" => Some(Arc::new(RedisStore::new(None).await.map_err(io_error)?) as Arc<dyn StateStore>),
        "none" => None,
        other => return Err(io_error(format!("Unknown SCHEDULER_STORE: {}", other))),
    };
    info!("Using {} state store", store_type);
    Ok(store)
}

async fn register_builtins(scheduler: &Scheduler) {
    scheduler
        .register_fn("health_check", |_, _| async move {
            Ok::<_, FunctionError>(json!({ "status": "healthy" }))
        })
        .await;

    scheduler
        .register_fn("echo", |args, kwargs| async move {
            Ok::<_, FunctionError>(json!({ "args": args, "kwargs": kwargs }))
        })
        .await;

    // sleep(seconds) - handy for exercising timeouts and the shutdown grace period
    scheduler
        .register_fn("sleep", |args: Vec<Value>, _: Map<String, Value>| async move {
            let secs = args.first().and_then(Value::as_f64).unwrap_or(1.0).max(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            Ok::<_, FunctionError>(json!({ "slept": secs }))
        })
        .await;
}

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let metrics_addr: SocketAddr = std::env::var("SCHEDULER_METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9000".to_string())
        .parse()
        .map_err(io_error)?;
    match PrometheusBuilder::new().with_http_listener(metrics_addr).install() {
        Ok(()) => info!("Prometheus metrics on http://{}/metrics", metrics_addr),
        Err(e) => warn!("Metrics exporter disabled: {}", e),
    }

    let config = SchedulerConfig::from_env().map_err(io_error)?;
    let store = build_store().await?;

    let scheduler = Scheduler::new(config, store);
    register_builtins(&scheduler).await;
    scheduler.start().await.map_err(io_error)?;

    info!("Scheduler service running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down scheduler service...");
    scheduler.stop().await;

    let stats = scheduler.get_stats().await;
    info!(
        "Final stats: processed={} failed={} retried={} schedules_executed={}",
        stats.tasks_processed, stats.tasks_failed, stats.tasks_retried, stats.schedules_executed
    );
    Ok(())
}
