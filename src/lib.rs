/// flowgrid: distributed workflow execution runtime
///
/// Plans node/edge graphs into leveled partitions and runs them through a
/// priority task queue, with result caching, pooled I/O, retries, circuit
/// breakers and memory back-pressure.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every component
pub mod error;

// Workflow data model - nodes, edges, tasks and the node type catalog
pub mod workflow;

// Runtime execution engine - queue, planner, executor and supporting components
pub mod runtime;

// HTTP API layer - plan, execution and metrics endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{PlanError, Result, RuntimeError};
pub use runtime::{AggregatedResult, ExecutionPlan, Runtime, TaskExecutor};
pub use server::start_server;
pub use workflow::{Edge, Node, NodeCatalog, Task, TaskPriority};
