/// Task executor that delegates each node to an HTTP callback
///
/// The task is POSTed as JSON to the graph owner's callback URL through the
/// pooled agent for that origin. A 2xx response body becomes the node output
/// (an empty body is `null`); any other status is reported as an execution
/// error carrying the status code so the retry classifier can tell 5xx/429
/// from permanent 4xx failures.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;

use crate::error::{Result, RuntimeError};
use crate::runtime::dispatcher::TaskExecutor;
use crate::runtime::pool::ConnectionPool;
use crate::workflow::types::Task;

#[derive(Debug, Clone)]
pub struct HttpCallbackExecutor {
    pool: Arc<ConnectionPool>,
    url: String,
}

impl HttpCallbackExecutor {
    pub fn new(pool: Arc<ConnectionPool>, url: impl Into<String>) -> Self {
        Self { pool, url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, client: &reqwest::Client, task: &Task) -> Result<Value> {
        let response = client.post(&self.url).json(task).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(RuntimeError::Execution(format!(
                "callback for node '{}' returned HTTP {}",
                task.node_id,
                status.as_u16()
            )));
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl TaskExecutor for HttpCallbackExecutor {
    async fn execute(&self, task: Task) -> Result<Value> {
        let lease = self.pool.get_http_agent(&self.url).await?;
        let started = Instant::now();
        tracing::debug!("📡 Calling back {} for node '{}'", self.url, task.node_id);
        let result = self.post(lease.client(), &task).await;
        self.pool.release_http_connection(lease, started.elapsed());
        result
    }
}
