use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::info;

pub type FunctionError = Box<dyn std::error::Error + Send + Sync>;
pub type FunctionResult = Result<Value, FunctionError>;

/// A unit of executable code a task refers to by name.
#[async_trait]
pub trait TaskFunction: Send + Sync {
    async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> FunctionResult;
}

struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> TaskFunction for FnTask<F>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FunctionResult> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> FunctionResult {
        (self.0)(args, kwargs).await
    }
}

#[derive(Default)]
pub(crate) struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<dyn TaskFunction>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: impl Into<String>, function: Arc<dyn TaskFunction>) {
        let name = name.into();
        info!("Registering function {}", name);
        self.functions.write().await.insert(name, function);
    }

    pub async fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult> + Send + 'static,
    {
        self.register(name, Arc::new(FnTask(f))).await;
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn TaskFunction>> {
        self.functions.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.functions.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.functions.read().await.len()
    }
}
