/// Worker pool draining the task queue
///
/// Callers hand a task and its executor to `submit` and get back a receiver
/// for the outcome. A fixed set of worker loops dequeues in priority order and
/// runs each task through its node type's circuit breaker and the retry
/// policy. Every attempt races the executor call, spawned on its own tokio
/// task, against the task timeout; a call that loses the race keeps running
/// in the background while the attempt is failed.
///
/// When the queue reports a duplicate of a task that is still in flight, the
/// caller is attached to the original's outcome instead of running it twice.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RuntimeError};
use crate::runtime::circuit_breaker::CircuitBreakerRegistry;
use crate::runtime::queue::{EnqueueOutcome, TaskQueue};
use crate::runtime::retry::{execute_with_retry, RetryPolicy};
use crate::workflow::types::{Task, TaskStatus};

/// Node-specific business logic supplied by the graph owner
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Run one task and return its output
    async fn execute(&self, task: Task) -> Result<Value>;
}

/// Adapter turning an async closure into a `TaskExecutor`
pub struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn execute(&self, task: Task) -> Result<Value> {
        (self.0)(task).await
    }
}

/// Wrap an async closure as a shareable executor
pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn TaskExecutor>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnExecutor(f))
}

/// Final word on one task, shared by every caller waiting on it
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        output: Value,
        attempts: u32,
        duration: Duration,
    },
    Failed {
        error: String,
        code: &'static str,
        attempts: u32,
        duration: Duration,
    },
    Cancelled,
}

/// How a submission was accepted
#[derive(Debug)]
pub enum Submission {
    /// The task was queued; its outcome arrives on the receiver
    Queued(oneshot::Receiver<TaskOutcome>),
    /// An identical task is in flight; this receiver shares its outcome
    Coalesced {
        original_id: String,
        receiver: oneshot::Receiver<TaskOutcome>,
    },
    /// An identical task ran within the dedup window and has already finished
    OriginalFinished { original_id: String },
}

struct Job {
    executor: Arc<dyn TaskExecutor>,
    waiters: Vec<oneshot::Sender<TaskOutcome>>,
}

pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    breakers: Arc<CircuitBreakerRegistry>,
    policy: RetryPolicy,
    jobs: Mutex<HashMap<String, Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("in_flight", &self.jobs.lock().len())
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(queue: Arc<TaskQueue>, breakers: Arc<CircuitBreakerRegistry>, policy: RetryPolicy) -> Self {
        Self {
            queue,
            breakers,
            policy,
            jobs: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Spawn `count` worker loops
    pub fn start(self: &Arc<Self>, count: usize) {
        let mut workers = self.workers.lock();
        for worker_id in 0..count {
            let dispatcher = self.clone();
            workers.push(tokio::spawn(async move { dispatcher.worker_loop(worker_id).await }));
        }
        tracing::info!("👷 Started {} dispatcher workers", count);
    }

    /// Stop the workers and fail every caller still waiting
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("⚠️ Dispatcher worker ended abnormally: {}", e);
            }
        }
        let orphaned = std::mem::take(&mut *self.jobs.lock());
        for (task_id, job) in orphaned {
            self.queue.cancel(&task_id);
            for waiter in job.waiters {
                let _ = waiter.send(TaskOutcome::Cancelled);
            }
        }
        tracing::info!("👷 Dispatcher stopped");
    }

    /// Queue a task, or attach to an identical one already in flight
    pub fn submit(&self, task: Task, executor: Arc<dyn TaskExecutor>) -> Result<Submission> {
        self.offer(task, executor, true)
    }

    /// Queue a task even if an identical one ran recently
    pub fn submit_fresh(&self, task: Task, executor: Arc<dyn TaskExecutor>) -> Result<oneshot::Receiver<TaskOutcome>> {
        match self.offer(task, executor, false)? {
            Submission::Queued(receiver) => Ok(receiver),
            _ => Err(RuntimeError::Execution("fresh submission was deduplicated".into())),
        }
    }

    fn offer(&self, task: Task, executor: Arc<dyn TaskExecutor>, deduplicate: bool) -> Result<Submission> {
        let (tx, rx) = oneshot::channel();
        let task_id = task.id.clone();

        // Registered before the task becomes visible to workers
        let mut jobs = self.jobs.lock();
        let outcome = if deduplicate {
            self.queue.submit(task)
        } else {
            self.queue.submit_bypassing_dedup(task)
        };

        match outcome {
            EnqueueOutcome::Queued => {
                jobs.insert(
                    task_id,
                    Job {
                        executor,
                        waiters: vec![tx],
                    },
                );
                Ok(Submission::Queued(rx))
            }
            EnqueueOutcome::Duplicate { original_id } => match jobs.get_mut(&original_id) {
                Some(job) => {
                    job.waiters.push(tx);
                    Ok(Submission::Coalesced {
                        original_id,
                        receiver: rx,
                    })
                }
                None => Ok(Submission::OriginalFinished { original_id }),
            },
            EnqueueOutcome::QueueFull => Err(RuntimeError::QueueFull {
                capacity: self.queue.config().max_queue_size,
            }),
        }
    }

    /// Cancel a task; queued tasks resolve at once, running ones at their next check
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut jobs = self.jobs.lock();
        let was_running = self.queue.status(task_id) == Some(TaskStatus::Running);
        if !self.queue.cancel(task_id) {
            return false;
        }
        if !was_running {
            if let Some(job) = jobs.remove(task_id) {
                for waiter in job.waiters {
                    let _ = waiter.send(TaskOutcome::Cancelled);
                }
            }
        }
        true
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.lock().len()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let notify = self.queue.notifier();
        tracing::debug!("👷 Worker {} ready", worker_id);
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.queue.dequeue() {
                Some(task) => self.run(task).await,
                None => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
        tracing::debug!("👷 Worker {} exiting", worker_id);
    }

    async fn run(&self, task: Task) {
        let task_id = task.id.clone();
        let Some(executor) = self.jobs.lock().get(&task_id).map(|job| job.executor.clone()) else {
            tracing::debug!("⏭️ Task {} was withdrawn before it ran", task_id);
            return;
        };

        let started = Instant::now();
        let outcome = if self.queue.is_cancelled(&task_id) {
            TaskOutcome::Cancelled
        } else {
            tracing::debug!("⚙️ Running task {} (node '{}')", task_id, task.node_id);
            self.execute(task, executor, started).await
        };

        match &outcome {
            TaskOutcome::Completed { .. } => {
                self.queue.complete(&task_id);
            }
            TaskOutcome::Failed { error, .. } => {
                self.queue.fail(&task_id, error.clone());
            }
            TaskOutcome::Cancelled => {}
        }

        let waiters = self.jobs.lock().remove(&task_id).map(|job| job.waiters).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn execute(&self, task: Task, executor: Arc<dyn TaskExecutor>, started: Instant) -> TaskOutcome {
        let breaker = self.breakers.get_or_create(&task.node_definition.node_type);
        let policy = self.policy.clone().with_max_retries(task.max_retries);
        let task_id = task.id.clone();

        let retried = execute_with_retry(&policy, |attempt| {
            let breaker = breaker.clone();
            let executor = executor.clone();
            let mut task = task.clone();
            let queue = self.queue.clone();
            async move {
                if queue.is_cancelled(&task.id) {
                    return Err(RuntimeError::Cancelled(task.id.clone()));
                }
                if attempt > 0 {
                    if let Some(retry_count) = queue.record_retry(&task.id) {
                        task.retry_count = retry_count;
                    }
                }
                breaker.execute(|| race_timeout(executor, task)).await
            }
        })
        .await;

        // Checked again so a cancelled task never publishes a result
        if self.queue.is_cancelled(&task_id) {
            return TaskOutcome::Cancelled;
        }

        let duration = started.elapsed();
        match retried.result {
            Ok(output) => TaskOutcome::Completed {
                output,
                attempts: retried.attempts,
                duration,
            },
            Err(error) => {
                tracing::warn!("❌ Task {} failed after {} attempt(s): {}", task_id, retried.attempts, error);
                TaskOutcome::Failed {
                    code: error.code(),
                    error: error.to_string(),
                    attempts: retried.attempts,
                    duration,
                }
            }
        }
    }
}

/// Run the executor on its own task and give up on it after the task timeout
async fn race_timeout(executor: Arc<dyn TaskExecutor>, task: Task) -> Result<Value> {
    let task_id = task.id.clone();
    let timeout = task.timeout();
    let call = tokio::spawn(async move { executor.execute(task).await });

    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(RuntimeError::Execution(format!("executor aborted: {}", join_error))),
        Err(_) => {
            tracing::warn!("⏱️ Task {} timed out after {:?}; call left running", task_id, timeout);
            Err(RuntimeError::TaskTimeout {
                task_id,
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, RetrySettings};
    use crate::runtime::circuit_breaker::BreakerConfig;
    use crate::runtime::events::EventBus;
    use crate::workflow::types::{Node, TaskPriority};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dispatcher(workers: usize) -> Arc<Dispatcher> {
        let events = EventBus::default();
        let queue = Arc::new(TaskQueue::new(QueueConfig::default(), events.clone()));
        let settings = RetrySettings {
            initial_delay_ms: 10,
            jitter: false,
            ..RetrySettings::default()
        };
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::from(&settings), events));
        let dispatcher = Arc::new(Dispatcher::new(queue, breakers, RetryPolicy::from(&settings)));
        if workers > 0 {
            dispatcher.start(workers);
        }
        dispatcher
    }

    fn task(node: &str) -> Task {
        Task::new("wf", Node::new(node, "transform"), json!({"n": node}))
    }

    fn queued(submission: Submission) -> oneshot::Receiver<TaskOutcome> {
        match submission {
            Submission::Queued(rx) => rx,
            other => panic!("expected queued, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runs_task_and_reports_output() {
        let d = dispatcher(2);
        let exec = executor_fn(|task: Task| async move { Ok(json!({"echo": task.input_data})) });
        let rx = queued(d.submit(task("a"), exec).unwrap());

        match rx.await.unwrap() {
            TaskOutcome::Completed { output, attempts, .. } => {
                assert_eq!(output, json!({"echo": {"n": "a"}}));
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(d.queue().metrics().total_completed, 1);
        assert_eq!(d.in_flight(), 0);
        d.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let d = dispatcher(1);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let exec = executor_fn(move |_task: Task| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RuntimeError::Execution("HTTP 503".into()))
                } else {
                    Ok(json!("done"))
                }
            }
        });

        let t = task("a");
        let id = t.id.clone();
        let outcome = queued(d.submit(t, exec).unwrap()).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Completed { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(d.queue().get_task(&id).unwrap().retry_count, 2);
        assert_eq!(d.queue().metrics().total_retried, 2);
        d.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_attempt() {
        let d = dispatcher(1);
        let exec = executor_fn(|_task: Task| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        });
        let slow = task("slow").with_timeout(Duration::from_millis(50)).with_max_retries(0);

        let outcome = queued(d.submit(slow, exec).unwrap()).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Failed { code: "TASK_TIMEOUT", attempts: 1, .. }));
        d.stop().await;
    }

    #[tokio::test]
    async fn test_duplicates_coalesce_onto_in_flight_task() {
        let d = dispatcher(0);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let exec = executor_fn(move |_task: Task| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!(7)) }
        });

        let first = queued(d.submit(task("same"), exec.clone()).unwrap());
        let second = match d.submit(task("same"), exec).unwrap() {
            Submission::Coalesced { receiver, .. } => receiver,
            other => panic!("expected coalesced, got {other:?}"),
        };

        d.start(1);
        let (a, b) = (first.await.unwrap(), second.await.unwrap());
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        d.stop().await;
    }

    #[tokio::test]
    async fn test_finished_original_is_reported() {
        let d = dispatcher(1);
        let exec = executor_fn(|_task: Task| async { Ok(json!(1)) });
        queued(d.submit(task("same"), exec.clone()).unwrap()).await.unwrap();

        assert!(matches!(
            d.submit(task("same"), exec.clone()).unwrap(),
            Submission::OriginalFinished { .. }
        ));
        let rx = d.submit_fresh(task("same"), exec).unwrap();
        assert!(matches!(rx.await.unwrap(), TaskOutcome::Completed { .. }));
        d.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_task_resolves_waiter() {
        let d = dispatcher(0);
        let exec = executor_fn(|_task: Task| async { Ok(Value::Null) });
        let t = task("a").with_priority(TaskPriority::Low);
        let id = t.id.clone();
        let rx = queued(d.submit(t, exec).unwrap());

        assert!(d.cancel(&id));
        assert_eq!(rx.await.unwrap(), TaskOutcome::Cancelled);
        assert!(d.queue().is_cancelled(&id));
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_task_suppresses_result() {
        let d = dispatcher(1);
        let exec = executor_fn(|_task: Task| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("late"))
        });
        let t = task("a");
        let id = t.id.clone();
        let rx = queued(d.submit(t, exec).unwrap());

        while d.queue().status(&id) != Some(TaskStatus::Running) {
            tokio::task::yield_now().await;
        }
        assert!(d.cancel(&id));
        assert_eq!(rx.await.unwrap(), TaskOutcome::Cancelled);
        d.stop().await;
    }
}
