/// Error taxonomy for the flowgrid runtime
///
/// Business-level node failures never travel through these types to the caller of
/// `execute_distributed`; they are recorded in the aggregated result instead.
/// What does surface here is resource exhaustion, timeouts, configuration and
/// planning mistakes, and transport failures from the pooled connections.

use thiserror::Error;

/// Result alias used across the runtime
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Runtime-level errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("task queue is full ({capacity} pending tasks)")]
    QueueFull { capacity: usize },

    #[error("timed out after {waited_ms}ms waiting for a database connection")]
    PoolTimeout { waited_ms: u64 },

    #[error("task '{task_id}' timed out after {timeout_ms}ms")]
    TaskTimeout { task_id: String, timeout_ms: u64 },

    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("task '{0}' was cancelled")]
    Cancelled(String),

    #[error("node execution failed: {0}")]
    Execution(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Stable machine-readable code for API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::QueueFull { .. } => "QUEUE_FULL",
            RuntimeError::PoolTimeout { .. } => "POOL_TIMEOUT",
            RuntimeError::TaskTimeout { .. } => "TASK_TIMEOUT",
            RuntimeError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            RuntimeError::Cancelled(_) => "CANCELLED",
            RuntimeError::Execution(_) => "EXECUTION_ERROR",
            RuntimeError::Cache(_) => "CACHE_ERROR",
            RuntimeError::Pool(_) => "POOL_ERROR",
            RuntimeError::Config(_) => "CONFIG_ERROR",
            RuntimeError::Plan(_) => "PLAN_ERROR",
            RuntimeError::Database(_) => "DATABASE_ERROR",
            RuntimeError::Http(_) => "HTTP_ERROR",
            RuntimeError::Serialization(_) => "SERIALIZATION_ERROR",
            RuntimeError::Io(_) => "IO_ERROR",
        }
    }

    /// Whether the error is a transient condition worth retrying
    ///
    /// `Execution` carries an opaque message from the node executor, so it is
    /// classified later by the retry layer's pattern lists.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::QueueFull { .. }
            | RuntimeError::PoolTimeout { .. }
            | RuntimeError::TaskTimeout { .. }
            | RuntimeError::Io(_) => true,
            RuntimeError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status()
                        .map(|s| s.is_server_error() || s.as_u16() == 429)
                        .unwrap_or(true)
            }
            RuntimeError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            RuntimeError::CircuitOpen { .. }
            | RuntimeError::Cancelled(_)
            | RuntimeError::Cache(_)
            | RuntimeError::Pool(_)
            | RuntimeError::Config(_)
            | RuntimeError::Plan(_)
            | RuntimeError::Serialization(_) => false,
            RuntimeError::Execution(_) => true,
        }
    }
}

/// Programmer errors detected while building an execution plan
///
/// Cycles are deliberately absent: they are reported as a plan diagnostic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("workflow id must not be empty")]
    EmptyWorkflowId,

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    UnknownEdgeEndpoint {
        from: String,
        to: String,
        missing: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(RuntimeError::QueueFull { capacity: 1 }.code(), "QUEUE_FULL");
        assert_eq!(
            RuntimeError::CircuitOpen { name: "http_request".into() }.code(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(
            RuntimeError::from(PlanError::EmptyWorkflowId).code(),
            "PLAN_ERROR"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RuntimeError::PoolTimeout { waited_ms: 10 }.is_retryable());
        assert!(RuntimeError::TaskTimeout { task_id: "t".into(), timeout_ms: 5 }.is_retryable());
        assert!(!RuntimeError::CircuitOpen { name: "db".into() }.is_retryable());
        assert!(!RuntimeError::Cancelled("t".into()).is_retryable());
        assert!(!RuntimeError::Config("bad".into()).is_retryable());
    }

    #[test]
    fn test_plan_error_message() {
        let err = PlanError::UnknownEdgeEndpoint {
            from: "a".into(),
            to: "ghost".into(),
            missing: "ghost".into(),
        };
        assert_eq!(err.to_string(), "edge a -> ghost references unknown node 'ghost'");
    }
}
