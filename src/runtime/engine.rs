/// Runtime wiring
///
/// `Runtime` owns one instance of every component (queue, cache, pool,
/// breakers, memory optimizer, dispatcher, executor), all sharing one
/// `EventBus`. Several runtimes can live in one process; nothing here is
/// global.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{PlanError, Result};
use crate::runtime::cache::{CacheMetrics, ResultCache};
use crate::runtime::circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreakerRegistry};
use crate::runtime::dispatcher::{Dispatcher, TaskExecutor};
use crate::runtime::events::{EventBus, RuntimeEvent};
use crate::runtime::executor::{AggregatedResult, DistributedExecutor, ExecutionOptions};
use crate::runtime::memory::{MemoryMetrics, MemoryOptimizer};
use crate::runtime::planner::{ExecutionPlan, Planner};
use crate::runtime::pool::{ConnectionPool, PoolMetrics};
use crate::runtime::queue::{QueueMetrics, TaskQueue};
use crate::runtime::retry::RetryPolicy;
use crate::workflow::catalog::NodeCatalog;
use crate::workflow::types::{Edge, Node, TaskPriority};

/// Point-in-time view of every component
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeMetrics {
    pub queue: QueueMetrics,
    pub cache: CacheMetrics,
    pub pool: PoolMetrics,
    pub memory: MemoryMetrics,
    pub breakers: Vec<BreakerSnapshot>,
}

#[derive(Debug)]
pub struct Runtime {
    config: Config,
    events: EventBus,
    catalog: Arc<NodeCatalog>,
    queue: Arc<TaskQueue>,
    cache: Arc<ResultCache>,
    pool: Arc<ConnectionPool>,
    breakers: Arc<CircuitBreakerRegistry>,
    memory: Arc<MemoryOptimizer>,
    dispatcher: Arc<Dispatcher>,
    executor: DistributedExecutor,
    shutdown: CancellationToken,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build and start a runtime with the built-in node catalog
    pub fn start(config: Config) -> Result<Arc<Self>> {
        Self::start_with_catalog(config, Arc::new(NodeCatalog::with_builtins()))
    }

    pub fn start_with_catalog(config: Config, catalog: Arc<NodeCatalog>) -> Result<Arc<Self>> {
        config.validate()?;
        tracing::info!("🔧 Starting runtime with {} workers", config.executor.workers);

        let events = EventBus::default();
        let queue = Arc::new(TaskQueue::new(config.queue.clone(), events.clone()));
        let cache = Arc::new(ResultCache::new(config.cache.clone(), events.clone()));
        let pool = Arc::new(ConnectionPool::new(config.pool.clone(), events.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            BreakerConfig::from(&config.retry),
            events.clone(),
        ));
        let memory = Arc::new(MemoryOptimizer::new(config.memory.clone(), events.clone()));
        memory.register(cache.clone());
        memory.register(queue.clone());

        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            breakers.clone(),
            RetryPolicy::from(&config.retry),
        ));
        let planner = Planner::new(catalog.clone(), config.executor.max_partitions_per_level);
        let executor = DistributedExecutor::new(
            planner,
            dispatcher.clone(),
            cache.clone(),
            memory.pressure(),
            events.clone(),
            config.executor.clone(),
        )
        .with_task_retries(config.retry.max_retries);

        let shutdown = CancellationToken::new();
        dispatcher.start(config.executor.workers);
        let mut background = vec![
            cache.spawn_sweeper(shutdown.clone()),
            pool.spawn_sweeper(shutdown.clone()),
        ];
        if config.memory.enabled {
            background.push(memory.clone().spawn(shutdown.clone()));
        }

        tracing::info!("✅ Runtime ready ({} node types)", catalog.type_names().len());
        Ok(Arc::new(Self {
            config,
            events,
            catalog,
            queue,
            cache,
            pool,
            breakers,
            memory,
            dispatcher,
            executor,
            shutdown,
            background: parking_lot::Mutex::new(background),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<NodeCatalog> {
        &self.catalog
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn memory(&self) -> &Arc<MemoryOptimizer> {
        &self.memory
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn executor(&self) -> &DistributedExecutor {
        &self.executor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    pub fn create_execution_plan(
        &self,
        workflow_id: &str,
        nodes: &[Node],
        edges: &[Edge],
    ) -> std::result::Result<ExecutionPlan, PlanError> {
        self.executor.create_execution_plan(workflow_id, nodes, edges)
    }

    pub async fn execute_distributed(
        &self,
        plan: &ExecutionPlan,
        executor: Arc<dyn TaskExecutor>,
        priority: TaskPriority,
    ) -> AggregatedResult {
        self.executor.execute_distributed(plan, executor, priority).await
    }

    pub async fn execute_distributed_with_cancel(
        &self,
        plan: &ExecutionPlan,
        executor: Arc<dyn TaskExecutor>,
        priority: TaskPriority,
        cancel: CancellationToken,
    ) -> AggregatedResult {
        self.executor
            .execute_distributed_with_cancel(plan, executor, priority, cancel)
            .await
    }

    pub async fn execute_distributed_with(
        &self,
        plan: &ExecutionPlan,
        executor: Arc<dyn TaskExecutor>,
        options: ExecutionOptions,
    ) -> AggregatedResult {
        self.executor.execute_distributed_with(plan, executor, options).await
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        RuntimeMetrics {
            queue: self.queue.metrics(),
            cache: self.cache.metrics(),
            pool: self.pool.metrics(),
            memory: self.memory.metrics(),
            breakers: self.breakers.snapshot(),
        }
    }

    /// Stop workers and background loops, then close pooled handles
    pub async fn shutdown(&self) {
        tracing::info!("🛑 Shutting down runtime");
        self.shutdown.cancel();
        self.dispatcher.stop().await;

        let background: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in background {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Background loop ended abnormally: {}", e);
            }
        }
        self.pool.shutdown().await;
        tracing::info!("👋 Runtime stopped");
    }
}
