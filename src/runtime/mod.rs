/// Workflow execution runtime
///
/// This module holds the components a `Runtime` wires together:
/// - Priority task queue with deduplication
/// - DAG planner and distributed partition executor
/// - Result cache, connection pool, retry and circuit breakers
/// - Memory monitor with back-pressure

// Runtime wiring: one instance of every component
pub mod engine;

// Level-by-level plan execution and result aggregation
pub mod executor;

// Worker loops draining the queue
pub mod dispatcher;

// DAG leveling into partitions
pub mod planner;

// Priority queue with dedup window
pub mod queue;

// Bounded TTL cache with LRU/LFU/FIFO eviction
pub mod cache;

// HTTP agents and database handles
pub mod pool;

pub mod retry;
pub mod circuit_breaker;

// Sampling, pressure levels and reclaim passes
pub mod memory;

// Broadcast channel of lifecycle events
pub mod events;

// Executor that calls back into the graph owner over HTTP
pub mod callback;

// Re-export main types
pub use callback::HttpCallbackExecutor;
pub use dispatcher::{executor_fn, TaskExecutor, TaskOutcome};
pub use engine::{Runtime, RuntimeMetrics};
pub use events::{EventBus, RuntimeEvent};
pub use executor::{AggregatedResult, ExecutionOptions, ExecutionResult, ExecutionStats, NodeStatus};
pub use planner::{ExecutionPlan, WorkflowPartition};
