/// Core workflow type definitions
///
/// Defines the node graph supplied by the graph owner (nodes and edges)
/// and the schedulable unit of work derived from it (tasks). These types are
/// serialized/deserialized from JSON at the API boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::workflow::fingerprint::fingerprint;

/// A single node in the workflow graph
///
/// The node type is a key into the node catalog; its semantics belong to the
/// external executor callback, the runtime only schedules it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "n1", "fetch-orders")
    pub id: String,
    /// Catalog key of the node type (e.g., "http_request", "ai_agent")
    pub node_type: String,
    /// Node-specific configuration parameters as flexible JSON
    #[serde(default)]
    pub params: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Connection between two nodes: `to` depends on the output of `from`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source node ID
    pub from: String,
    /// Target node ID
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Priority tier of a task; dequeue order is critical > high > normal > low
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Tiers in the order the queue drains them
    pub const DRAIN_ORDER: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

/// Lifecycle of a task
///
/// pending -> queued -> running -> {completed | failed | cancelled};
/// failed may go back to pending through a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A schedulable unit of work: one node invocation with its assembled input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub node_definition: Node,
    pub input_data: Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution timeout in milliseconds
    pub timeout_ms: u64,
    /// Node ids this task's input was assembled from
    pub dependencies: Vec<String>,
    /// Last failure message, if any
    pub error: Option<String>,
}

impl Task {
    /// Create a pending task for a node with default priority, retries and timeout
    pub fn new(workflow_id: impl Into<String>, node: Node, input_data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            node_id: node.id.clone(),
            node_definition: node,
            input_data,
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_ms: 30_000,
            dependencies: Vec::new(),
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Content fingerprint of (workflow, node, input), shared by dedup and cache
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.workflow_id, &self.node_id, &self.input_data)
    }

    /// Time spent waiting in the queue, once started
    pub fn wait_time(&self) -> Option<Duration> {
        self.started_at
            .and_then(|started| (started - self.created_at).to_std().ok())
    }

    /// Time spent running, once finished
    pub fn execution_time(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => (completed - started).to_std().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::DRAIN_ORDER[0], TaskPriority::Critical);
    }

    #[test]
    fn test_task_defaults_and_builders() {
        let node = Node::new("n1", "transform").with_params(json!({"expr": "x + 1"}));
        let task = Task::new("wf-1", node, json!({"x": 1}))
            .with_priority(TaskPriority::High)
            .with_max_retries(5)
            .with_timeout(Duration::from_secs(2));

        assert_eq!(task.node_id, "n1");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.max_retries, 5);
        assert_eq!(task.timeout(), Duration::from_secs(2));
        assert!(task.wait_time().is_none());
    }

    #[test]
    fn test_same_identity_same_fingerprint() {
        let a = Task::new("wf-1", Node::new("n1", "transform"), json!({"a": 1, "b": 2}));
        let b = Task::new("wf-1", Node::new("n1", "transform"), json!({"b": 2, "a": 1}));
        let c = Task::new("wf-1", Node::new("n2", "transform"), json!({"a": 1, "b": 2}));

        assert_ne!(a.id, b.id);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_serde_lowercase() {
        let value = serde_json::to_value(TaskPriority::Critical).unwrap();
        assert_eq!(value, json!("critical"));
        let status: TaskStatus = serde_json::from_value(json!("cancelled")).unwrap();
        assert!(status.is_terminal());
    }
}
