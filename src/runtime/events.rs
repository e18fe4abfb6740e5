/// Runtime event channel
///
/// Every component receives a clone of the `EventBus` at construction and
/// publishes lifecycle notifications through it. Consumers (dashboards, the
/// metrics API, tests) call `subscribe()` and read from a broadcast receiver.
/// Publishing never blocks and succeeds even with no subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::workflow::types::TaskPriority;

const DEFAULT_CAPACITY: usize = 1024;

/// Lifecycle notification emitted by a runtime component
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    // Queue
    TaskQueued { task_id: String, priority: TaskPriority },
    TaskDequeued { task_id: String, wait_ms: u64 },
    TaskCompleted { task_id: String, execution_ms: u64 },
    TaskFailed { task_id: String, error: String },
    TaskRetried { task_id: String, retry_count: u32 },
    TaskCancelled { task_id: String },
    DuplicateTask { task_id: String, original_id: String },
    QueueFull { task_id: String, capacity: usize },

    // Cache
    EntryAdded { key: String, size: usize, compressed: bool },
    EntryRemoved { key: String },
    EntriesEvicted { count: usize, bytes: usize },

    // Pool
    DbConnectionCreated { connection_id: String },
    DbConnectionClosed { connection_id: String },
    HttpAgentCreated { origin: String },
    HttpAgentClosed { origin: String },

    // Memory
    MemoryWarning { used_mb: f64 },
    MemoryCritical { used_mb: f64 },
    GcCompleted { reclaimed: usize, duration_ms: u64 },
    MemoryLeakDetected { growth_mb_per_min: f64 },

    // Breakers
    CircuitOpened { name: String },
    CircuitClosed { name: String },

    // Executor
    ExecutionCompleted {
        workflow_id: String,
        success: bool,
        total_execution_ms: u64,
        errors: usize,
    },
}

impl RuntimeEvent {
    /// Snake-case event name as seen by subscribers
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::TaskQueued { .. } => "task_queued",
            RuntimeEvent::TaskDequeued { .. } => "task_dequeued",
            RuntimeEvent::TaskCompleted { .. } => "task_completed",
            RuntimeEvent::TaskFailed { .. } => "task_failed",
            RuntimeEvent::TaskRetried { .. } => "task_retried",
            RuntimeEvent::TaskCancelled { .. } => "task_cancelled",
            RuntimeEvent::DuplicateTask { .. } => "duplicate_task",
            RuntimeEvent::QueueFull { .. } => "queue_full",
            RuntimeEvent::EntryAdded { .. } => "entry_added",
            RuntimeEvent::EntryRemoved { .. } => "entry_removed",
            RuntimeEvent::EntriesEvicted { .. } => "entries_evicted",
            RuntimeEvent::DbConnectionCreated { .. } => "db_connection_created",
            RuntimeEvent::DbConnectionClosed { .. } => "db_connection_closed",
            RuntimeEvent::HttpAgentCreated { .. } => "http_agent_created",
            RuntimeEvent::HttpAgentClosed { .. } => "http_agent_closed",
            RuntimeEvent::MemoryWarning { .. } => "memory_warning",
            RuntimeEvent::MemoryCritical { .. } => "memory_critical",
            RuntimeEvent::GcCompleted { .. } => "gc_completed",
            RuntimeEvent::MemoryLeakDetected { .. } => "memory_leak_detected",
            RuntimeEvent::CircuitOpened { .. } => "circuit_opened",
            RuntimeEvent::CircuitClosed { .. } => "circuit_closed",
            RuntimeEvent::ExecutionCompleted { .. } => "execution_completed",
        }
    }
}

/// Cloneable handle to the broadcast channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: RuntimeEvent) {
        tracing::trace!("📣 {}", event.name());
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
