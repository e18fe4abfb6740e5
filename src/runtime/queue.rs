/// Priority task queue with deduplication
///
/// Four FIFO buckets (critical, high, normal, low) drained highest first.
/// Tasks are indexed by id for O(1) lookup, and fingerprints enqueued within
/// the deduplication window suppress identical work; expired fingerprints are
/// swept every few hundred inserts. All state sits behind one
/// mutex; no method awaits while holding it, so a caller may dequeue and
/// immediately re-enqueue without tripping over its own lock.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::QueueConfig;
use crate::runtime::events::{EventBus, RuntimeEvent};
use crate::runtime::memory::Reclaim;
use crate::workflow::types::{Task, TaskPriority, TaskStatus};

/// Fingerprints recorded between two sweeps of expired ones
const DEDUP_SWEEP_EVERY: u64 = 256;

/// Result of offering a task to the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// An identical task was enqueued within the dedup window
    Duplicate { original_id: String },
    /// Pending count reached `max_queue_size`
    QueueFull,
}

/// Point-in-time queue metrics, derived from rolling counters
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub pending: usize,
    pub running: usize,
    pub backlog: BTreeMap<TaskPriority, usize>,
    /// Backlog weighted by the configured priority weights
    pub weighted_backlog: u64,
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_duplicates: u64,
    pub total_rejected: u64,
    /// In-place retry attempts made by workers
    pub total_retried: u64,
    /// Fingerprints currently held for deduplication
    pub fingerprints: usize,
    pub average_wait_ms: f64,
    pub average_execution_ms: f64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: u64,
    dequeued: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    duplicates: u64,
    rejected: u64,
    retried: u64,
    total_wait_ms: u64,
    finished: u64,
    total_execution_ms: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    buckets: BTreeMap<TaskPriority, VecDeque<String>>,
    tasks: HashMap<String, Task>,
    /// fingerprint -> (enqueued at, task id)
    dedup: HashMap<String, (Instant, String)>,
    /// Fingerprints recorded since the last expiry sweep
    dedup_inserts: u64,
    /// Terminal task ids, oldest first
    history: VecDeque<String>,
    running: usize,
    counters: Counters,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    fn push(&mut self, mut task: Task) {
        task.status = TaskStatus::Queued;
        self.buckets
            .entry(task.priority)
            .or_default()
            .push_back(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        self.counters.enqueued += 1;
    }

    /// Remember a fingerprint, sweeping expired ones every so often
    fn remember(&mut self, fingerprint: String, task_id: String, now: Instant, window: Duration) -> usize {
        self.dedup.insert(fingerprint, (now, task_id));
        self.dedup_inserts += 1;
        if self.dedup_inserts < DEDUP_SWEEP_EVERY {
            return 0;
        }
        self.purge_fingerprints(now, window)
    }

    fn purge_fingerprints(&mut self, now: Instant, window: Duration) -> usize {
        self.dedup_inserts = 0;
        let before = self.dedup.len();
        self.dedup
            .retain(|_, (seen_at, _)| now.duration_since(*seen_at) < window);
        before - self.dedup.len()
    }

    fn archive(&mut self, task_id: &str, max_history: usize) {
        self.history.push_back(task_id.to_string());
        while self.history.len() > max_history {
            if let Some(old) = self.history.pop_front() {
                self.tasks.remove(&old);
            }
        }
    }
}

/// Priority-ordered, deduplicating task queue
#[derive(Debug)]
pub struct TaskQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Arc<Notify>,
    events: EventBus,
}

impl TaskQueue {
    pub fn new(config: QueueConfig, events: EventBus) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Arc::new(Notify::new()),
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Wakeup handle for workers blocked on an empty queue
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Enqueue honouring capacity and deduplication; `false` when not queued
    pub fn enqueue(&self, task: Task) -> bool {
        matches!(self.submit(task), EnqueueOutcome::Queued)
    }

    /// Enqueue and report why a task was not queued
    pub fn submit(&self, task: Task) -> EnqueueOutcome {
        self.offer(task, self.config.enable_deduplication)
    }

    /// Enqueue honouring capacity only
    pub fn submit_bypassing_dedup(&self, task: Task) -> EnqueueOutcome {
        self.offer(task, false)
    }

    fn offer(&self, task: Task, deduplicate: bool) -> EnqueueOutcome {
        let task_id = task.id.clone();
        let priority = task.priority;
        let capacity = self.config.max_queue_size;

        let outcome = {
            let mut state = self.state.lock();

            if state.pending() >= capacity {
                state.counters.rejected += 1;
                EnqueueOutcome::QueueFull
            } else {
                let fingerprint = task.fingerprint();
                let window = Duration::from_millis(self.config.deduplication_window_ms);
                let now = Instant::now();

                let duplicate_of = if deduplicate {
                    match state.dedup.get(&fingerprint) {
                        Some((seen_at, original)) if now.duration_since(*seen_at) < window => {
                            Some(original.clone())
                        }
                        _ => None,
                    }
                } else {
                    None
                };

                match duplicate_of {
                    Some(original_id) => {
                        state.counters.duplicates += 1;
                        EnqueueOutcome::Duplicate { original_id }
                    }
                    None => {
                        let purged = state.remember(fingerprint, task_id.clone(), now, window);
                        if purged > 0 {
                            tracing::debug!("🧹 Dropped {} expired dedup fingerprints", purged);
                        }
                        state.push(task);
                        EnqueueOutcome::Queued
                    }
                }
            }
        };

        match &outcome {
            EnqueueOutcome::Queued => {
                tracing::debug!("📥 Queued task {} ({})", task_id, priority.as_str());
                self.events.emit(RuntimeEvent::TaskQueued { task_id, priority });
                self.notify.notify_one();
            }
            EnqueueOutcome::Duplicate { original_id } => {
                tracing::debug!("♻️ Task {} duplicates {}", task_id, original_id);
                self.events.emit(RuntimeEvent::DuplicateTask {
                    task_id,
                    original_id: original_id.clone(),
                });
            }
            EnqueueOutcome::QueueFull => {
                tracing::warn!("🚫 Queue full ({} pending), rejected task {}", capacity, task_id);
                self.events.emit(RuntimeEvent::QueueFull { task_id, capacity });
            }
        }

        outcome
    }

    /// Pop the head of the highest non-empty tier and mark it running
    pub fn dequeue(&self) -> Option<Task> {
        let (task, wait_ms) = {
            let mut state = self.state.lock();
            let task_id = TaskPriority::DRAIN_ORDER.iter().find_map(|priority| {
                state
                    .buckets
                    .get_mut(priority)
                    .and_then(VecDeque::pop_front)
            })?;

            let now = chrono::Utc::now();
            let task = state.tasks.get_mut(&task_id)?;
            task.status = TaskStatus::Running;
            task.started_at = Some(now);
            let wait_ms = task.wait_time().map(|d| d.as_millis() as u64).unwrap_or(0);
            let task = task.clone();

            state.running += 1;
            state.counters.dequeued += 1;
            state.counters.total_wait_ms += wait_ms;
            (task, wait_ms)
        };

        self.events.emit(RuntimeEvent::TaskDequeued {
            task_id: task.id.clone(),
            wait_ms,
        });
        Some(task)
    }

    /// Mark a running task completed
    pub fn complete(&self, task_id: &str) -> bool {
        let execution_ms = {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Running {
                return false;
            }
            task.status = TaskStatus::Completed;
            task.completed_at = Some(chrono::Utc::now());
            let execution_ms = task
                .execution_time()
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);

            state.running = state.running.saturating_sub(1);
            state.counters.completed += 1;
            state.counters.finished += 1;
            state.counters.total_execution_ms += execution_ms;
            state.archive(task_id, self.config.max_history);
            execution_ms
        };

        self.events.emit(RuntimeEvent::TaskCompleted {
            task_id: task_id.to_string(),
            execution_ms,
        });
        true
    }

    /// Mark a running task failed with an error message
    pub fn fail(&self, task_id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Running {
                return false;
            }
            task.status = TaskStatus::Failed;
            task.completed_at = Some(chrono::Utc::now());
            task.error = Some(error.clone());
            let execution_ms = task
                .execution_time()
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);

            state.running = state.running.saturating_sub(1);
            state.counters.failed += 1;
            state.counters.finished += 1;
            state.counters.total_execution_ms += execution_ms;
            state.archive(task_id, self.config.max_history);
        }

        tracing::debug!("💥 Task {} failed: {}", task_id, error);
        self.events.emit(RuntimeEvent::TaskFailed {
            task_id: task_id.to_string(),
            error,
        });
        true
    }

    /// Send a failed task back to its bucket; `false` once retries are exhausted
    pub fn retry(&self, task_id: &str) -> bool {
        let retry_count = {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Failed || task.retry_count >= task.max_retries {
                return false;
            }

            let mut task = task.clone();
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.completed_at = None;
            let retry_count = task.retry_count;

            state.history.retain(|id| id != task_id);
            state.push(task);
            retry_count
        };

        tracing::debug!("🔁 Retrying task {} (attempt {})", task_id, retry_count + 1);
        self.events.emit(RuntimeEvent::TaskRetried {
            task_id: task_id.to_string(),
            retry_count,
        });
        self.notify.notify_one();
        true
    }

    /// Count one more in-place attempt on a running task; returns its retry count
    pub fn record_retry(&self, task_id: &str) -> Option<u32> {
        let retry_count = {
            let mut state = self.state.lock();
            let task = state.tasks.get_mut(task_id)?;
            if task.status != TaskStatus::Running {
                return None;
            }
            task.retry_count += 1;
            let retry_count = task.retry_count;
            state.counters.retried += 1;
            retry_count
        };

        tracing::debug!("🔁 Retrying task {} in place (attempt {})", task_id, retry_count + 1);
        self.events.emit(RuntimeEvent::TaskRetried {
            task_id: task_id.to_string(),
            retry_count,
        });
        Some(retry_count)
    }

    /// Remove a queued task, or flag a running one for its worker to observe
    pub fn cancel(&self, task_id: &str) -> bool {
        {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get(task_id) else {
                return false;
            };
            let status = task.status;
            let priority = task.priority;

            match status {
                TaskStatus::Pending | TaskStatus::Queued => {
                    if let Some(bucket) = state.buckets.get_mut(&priority) {
                        bucket.retain(|id| id != task_id);
                    }
                }
                TaskStatus::Running => {
                    state.running = state.running.saturating_sub(1);
                }
                _ => return false,
            }

            if let Some(task) = state.tasks.get_mut(task_id) {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(chrono::Utc::now());
            }
            state.counters.cancelled += 1;
            state.archive(task_id, self.config.max_history);
        }

        tracing::debug!("🛑 Cancelled task {}", task_id);
        self.events.emit(RuntimeEvent::TaskCancelled {
            task_id: task_id.to_string(),
        });
        true
    }

    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.status(task_id) == Some(TaskStatus::Cancelled)
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.state.lock().tasks.get(task_id).map(|t| t.status)
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.state.lock().tasks.get(task_id).cloned()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_len() == 0
    }

    /// Drop dedup fingerprints older than the window; returns how many went
    pub fn purge_stale_fingerprints(&self) -> usize {
        let window = Duration::from_millis(self.config.deduplication_window_ms);
        self.state.lock().purge_fingerprints(Instant::now(), window)
    }

    pub fn metrics(&self) -> QueueMetrics {
        let state = self.state.lock();
        let backlog: BTreeMap<TaskPriority, usize> = TaskPriority::DRAIN_ORDER
            .iter()
            .map(|p| (*p, state.buckets.get(p).map(VecDeque::len).unwrap_or(0)))
            .collect();
        let weighted_backlog = backlog
            .iter()
            .map(|(p, n)| {
                let weight = self.config.priority_weights.get(p).copied().unwrap_or(1);
                *n as u64 * weight as u64
            })
            .sum();

        let c = &state.counters;
        QueueMetrics {
            pending: state.pending(),
            running: state.running,
            backlog,
            weighted_backlog,
            total_enqueued: c.enqueued,
            total_completed: c.completed,
            total_failed: c.failed,
            total_cancelled: c.cancelled,
            total_duplicates: c.duplicates,
            total_rejected: c.rejected,
            total_retried: c.retried,
            fingerprints: state.dedup.len(),
            average_wait_ms: average(c.total_wait_ms, c.dequeued),
            average_execution_ms: average(c.total_execution_ms, c.finished),
        }
    }
}

impl Reclaim for TaskQueue {
    fn name(&self) -> &str {
        "task_queue"
    }

    /// Halve terminal history and drop stale fingerprints
    fn reclaim(&self) -> usize {
        let stale = self.purge_stale_fingerprints();
        let mut state = self.state.lock();
        let keep = state.history.len() / 2;
        let mut pruned = 0;
        while state.history.len() > keep {
            if let Some(old) = state.history.pop_front() {
                state.tasks.remove(&old);
                pruned += 1;
            }
        }
        stale + pruned
    }
}

fn average(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}
