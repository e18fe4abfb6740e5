/// Workflow Definition Layer
///
/// This module holds everything the runtime knows about a workflow before it
/// runs:
/// - Type definitions (Node, Edge, Task)
/// - Content fingerprints shared by deduplication and caching
/// - Lock-free node type catalog using ArcSwap

// Core workflow and task type definitions
pub mod types;

// Deterministic (workflow, node, input) fingerprints
pub mod fingerprint;

// Hot-swappable node type catalog
pub mod catalog;

// Re-export commonly used types
pub use catalog::{Capability, NodeCatalog, NodeTypeSpec};
pub use types::{Edge, Node, Task, TaskPriority, TaskStatus};
