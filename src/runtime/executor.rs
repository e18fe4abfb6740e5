/// Distributed plan execution
///
/// Drives an `ExecutionPlan` to completion:
/// - levels run strictly in order, every partition of a level concurrently
/// - nodes of a partition run one after another in discovery order
/// - each node becomes a `Task` submitted to the shared dispatcher, so
///   priorities, dedup, retries and circuit breakers apply per node
/// - a failed node aborts the rest of its partition but never its siblings
///
/// The outcome is always an `AggregatedResult`; node failures are data, not
/// errors.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::error::{PlanError, RuntimeError};
use crate::runtime::cache::ResultCache;
use crate::runtime::dispatcher::{Dispatcher, Submission, TaskExecutor, TaskOutcome};
use crate::runtime::events::{EventBus, RuntimeEvent};
use crate::runtime::memory::PressureLevel;
use crate::runtime::planner::{ExecutionPlan, Planner, WorkflowPartition};
use crate::workflow::types::{Edge, Node, Task, TaskPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Completed,
    Failed,
    /// Not run: an upstream node produced no result or the partition was aborted
    Skipped,
    Cancelled,
}

/// What happened to one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub node_id: String,
    /// Task that produced the result; for coalesced results, the original task
    pub task_id: Option<String>,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
    /// Served from the result cache without running
    pub cached: bool,
    /// Shared the outcome of an identical in-flight task
    pub coalesced: bool,
}

impl ExecutionResult {
    fn unrun(node_id: &str, status: NodeStatus, reason: Option<String>) -> Self {
        Self {
            node_id: node_id.to_string(),
            task_id: None,
            status,
            output: None,
            error: reason,
            attempts: 0,
            duration_ms: 0,
            cached: false,
            coalesced: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == NodeStatus::Completed
    }
}

/// A node failure recorded against its partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    /// `None` for nodes the plan could not schedule
    pub partition_id: Option<String>,
    pub node_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub workflow_id: String,
    /// True when no node failed and nothing was cancelled
    pub success: bool,
    pub cancelled: bool,
    /// partition id -> node id -> result
    pub partition_results: BTreeMap<String, BTreeMap<String, ExecutionResult>>,
    pub total_execution_time_ms: u64,
    pub errors: Vec<NodeError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub cached: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
}

impl AggregatedResult {
    /// Flatten every partition into one node id -> result map
    pub fn aggregate_results(&self) -> BTreeMap<String, ExecutionResult> {
        self.partition_results
            .values()
            .flat_map(|nodes| nodes.iter().map(|(id, result)| (id.clone(), result.clone())))
            .collect()
    }

    pub fn get_execution_stats(&self) -> ExecutionStats {
        let all = self.aggregate_results();
        let count = |status: NodeStatus| all.values().filter(|r| r.status == status).count();

        let total = all.len();
        let completed = count(NodeStatus::Completed);
        let failed = count(NodeStatus::Failed);
        let rate = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };

        ExecutionStats {
            total,
            completed,
            failed,
            skipped: count(NodeStatus::Skipped),
            cancelled: count(NodeStatus::Cancelled),
            cached: all.values().filter(|r| r.cached).count(),
            success_rate: rate(completed),
            failure_rate: rate(failed),
        }
    }

    pub fn result_for(&self, node_id: &str) -> Option<&ExecutionResult> {
        self.partition_results.values().find_map(|nodes| nodes.get(node_id))
    }
}

/// Per-call knobs for `execute_distributed_with`
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub priority: TaskPriority,
    /// Input handed to root nodes
    pub input: Value,
    pub cancel: CancellationToken,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            priority: TaskPriority::Normal,
            input: Value::Null,
            cancel: CancellationToken::new(),
        }
    }
}

struct PartitionRun {
    partition_id: String,
    results: BTreeMap<String, ExecutionResult>,
    errors: Vec<NodeError>,
}

pub struct DistributedExecutor {
    planner: Planner,
    dispatcher: Arc<Dispatcher>,
    cache: Arc<ResultCache>,
    pressure: watch::Receiver<PressureLevel>,
    events: EventBus,
    config: ExecutorConfig,
    task_retries: u32,
}

impl std::fmt::Debug for DistributedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedExecutor")
            .field("config", &self.config)
            .field("task_retries", &self.task_retries)
            .finish()
    }
}

impl DistributedExecutor {
    pub fn new(
        planner: Planner,
        dispatcher: Arc<Dispatcher>,
        cache: Arc<ResultCache>,
        pressure: watch::Receiver<PressureLevel>,
        events: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            planner,
            dispatcher,
            cache,
            pressure,
            events,
            config,
            task_retries: 3,
        }
    }

    /// Retry budget stamped on every task this executor creates
    pub fn with_task_retries(mut self, retries: u32) -> Self {
        self.task_retries = retries;
        self
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn create_execution_plan(
        &self,
        workflow_id: &str,
        nodes: &[Node],
        edges: &[Edge],
    ) -> std::result::Result<ExecutionPlan, PlanError> {
        self.planner.create_execution_plan(workflow_id, nodes, edges)
    }

    pub async fn execute_distributed(
        &self,
        plan: &ExecutionPlan,
        executor: Arc<dyn TaskExecutor>,
        priority: TaskPriority,
    ) -> AggregatedResult {
        let options = ExecutionOptions {
            priority,
            ..ExecutionOptions::default()
        };
        self.execute_distributed_with(plan, executor, options).await
    }

    pub async fn execute_distributed_with_cancel(
        &self,
        plan: &ExecutionPlan,
        executor: Arc<dyn TaskExecutor>,
        priority: TaskPriority,
        cancel: CancellationToken,
    ) -> AggregatedResult {
        let options = ExecutionOptions {
            priority,
            cancel,
            ..ExecutionOptions::default()
        };
        self.execute_distributed_with(plan, executor, options).await
    }

    pub async fn execute_distributed_with(
        &self,
        plan: &ExecutionPlan,
        executor: Arc<dyn TaskExecutor>,
        options: ExecutionOptions,
    ) -> AggregatedResult {
        let started = Instant::now();
        tracing::info!(
            "🚀 Executing workflow '{}': {} partitions over {} levels",
            plan.workflow_id,
            plan.partitions.len(),
            plan.level_count()
        );

        let finished: Mutex<HashMap<String, ExecutionResult>> = Mutex::new(HashMap::new());
        let mut partition_results = BTreeMap::new();
        let mut errors = Vec::new();

        for (level, partition_ids) in plan.execution_order.iter().enumerate() {
            tracing::debug!("📶 Level {}: {:?}", level, partition_ids);
            let runs = partition_ids
                .iter()
                .filter_map(|id| plan.partition(id))
                .map(|partition| self.run_partition(plan, partition, &executor, &options, &finished));

            for run in join_all(runs).await {
                errors.extend(run.errors);
                partition_results.insert(run.partition_id, run.results);
            }
        }

        for node_id in plan.unresolved_nodes() {
            errors.push(NodeError {
                partition_id: None,
                node_id: node_id.to_string(),
                code: "CYCLIC_DEPENDENCY".to_string(),
                message: "node sits on a dependency cycle and was not scheduled".to_string(),
            });
        }

        let cancelled = partition_results
            .values()
            .flat_map(|nodes| nodes.values())
            .any(|r| r.status == NodeStatus::Cancelled);
        let success = errors.is_empty() && !cancelled;
        let total_execution_time_ms = started.elapsed().as_millis() as u64;

        if success {
            tracing::info!("✅ Workflow '{}' finished in {}ms", plan.workflow_id, total_execution_time_ms);
        } else {
            tracing::warn!(
                "⚠️ Workflow '{}' finished with {} error(s){} in {}ms",
                plan.workflow_id,
                errors.len(),
                if cancelled { " (cancelled)" } else { "" },
                total_execution_time_ms
            );
        }
        self.events.emit(RuntimeEvent::ExecutionCompleted {
            workflow_id: plan.workflow_id.clone(),
            success,
            total_execution_ms: total_execution_time_ms,
            errors: errors.len(),
        });

        AggregatedResult {
            workflow_id: plan.workflow_id.clone(),
            success,
            cancelled,
            partition_results,
            total_execution_time_ms,
            errors,
        }
    }

    async fn run_partition(
        &self,
        plan: &ExecutionPlan,
        partition: &WorkflowPartition,
        executor: &Arc<dyn TaskExecutor>,
        options: &ExecutionOptions,
        finished: &Mutex<HashMap<String, ExecutionResult>>,
    ) -> PartitionRun {
        let mut run = PartitionRun {
            partition_id: partition.id.clone(),
            results: BTreeMap::new(),
            errors: Vec::new(),
        };
        let mut aborted_by: Option<String> = None;

        for node in &partition.nodes {
            let result = if options.cancel.is_cancelled() || !self.wait_for_memory(&options.cancel).await {
                ExecutionResult::unrun(&node.id, NodeStatus::Cancelled, None)
            } else if let Some(failed) = &aborted_by {
                let reason = format!("partition aborted after '{}' failed", failed);
                ExecutionResult::unrun(&node.id, NodeStatus::Skipped, Some(reason))
            } else {
                let upstream = plan.upstream_of(&node.id);
                let assembled = assemble_input(&upstream, &finished.lock(), &options.input);
                match assembled {
                    Err(blocked) => {
                        let reason = format!("upstream '{}' produced no result", blocked);
                        tracing::debug!("⏭️ Skipping '{}': {}", node.id, reason);
                        ExecutionResult::unrun(&node.id, NodeStatus::Skipped, Some(reason))
                    }
                    Ok(input) => {
                        let dependencies = upstream.iter().map(|id| id.to_string()).collect();
                        self.run_node(plan, node, input, dependencies, executor, options).await
                    }
                }
            };

            if result.status == NodeStatus::Failed {
                aborted_by = Some(node.id.clone());
                run.errors.push(NodeError {
                    partition_id: Some(partition.id.clone()),
                    node_id: node.id.clone(),
                    code: failure_code(&result),
                    message: result.error.clone().unwrap_or_default(),
                });
            }

            finished.lock().insert(node.id.clone(), result.clone());
            run.results.insert(node.id.clone(), result);
        }

        run
    }

    async fn run_node(
        &self,
        plan: &ExecutionPlan,
        node: &Node,
        input: Value,
        dependencies: Vec<String>,
        executor: &Arc<dyn TaskExecutor>,
        options: &ExecutionOptions,
    ) -> ExecutionResult {
        let started = Instant::now();
        let cacheable = self
            .planner
            .catalog()
            .get(&node.node_type)
            .map(|spec| spec.cacheable)
            .unwrap_or(false);
        let use_cache = self.config.use_cache && cacheable;

        let task = Task::new(plan.workflow_id.clone(), node.clone(), input)
            .with_priority(options.priority)
            .with_timeout(Duration::from_millis(self.dispatcher.queue().config().task_timeout_ms))
            .with_max_retries(self.task_retries)
            .with_dependencies(dependencies);
        let key = task.fingerprint();

        if use_cache {
            if let Some(output) = self.cache.get::<Value>(&key) {
                tracing::debug!("💾 Cache hit for node '{}'", node.id);
                return cached_result(&node.id, output);
            }
        }

        let submitted = match self.dispatcher.submit(task.clone(), executor.clone()) {
            Ok(Submission::Queued(receiver)) => Ok((task.id.clone(), receiver, false)),
            Ok(Submission::Coalesced { original_id, receiver }) => {
                tracing::debug!("🔗 Node '{}' joined in-flight task {}", node.id, original_id);
                Ok((original_id, receiver, true))
            }
            Ok(Submission::OriginalFinished { original_id }) => {
                if use_cache {
                    if let Some(output) = self.cache.get::<Value>(&key) {
                        return cached_result(&node.id, output);
                    }
                }
                tracing::debug!("🔁 Original task {} already finished; resubmitting '{}'", original_id, node.id);
                self.dispatcher
                    .submit_fresh(task.clone(), executor.clone())
                    .map(|receiver| (task.id.clone(), receiver, false))
            }
            Err(e) => Err(e),
        };

        let (task_id, mut receiver, coalesced) = match submitted {
            Ok(parts) => parts,
            Err(e) => return rejected(&node.id, &task.id, &e, started),
        };

        let outcome = tokio::select! {
            outcome = &mut receiver => outcome.unwrap_or(TaskOutcome::Cancelled),
            _ = options.cancel.cancelled() => {
                // A coalesced task belongs to someone else
                if !coalesced {
                    self.dispatcher.cancel(&task_id);
                }
                TaskOutcome::Cancelled
            }
        };

        let mut result = ExecutionResult {
            task_id: Some(task_id),
            coalesced,
            duration_ms: started.elapsed().as_millis() as u64,
            ..ExecutionResult::unrun(&node.id, NodeStatus::Cancelled, None)
        };
        match outcome {
            TaskOutcome::Completed { output, attempts, .. } => {
                if use_cache {
                    if let Err(e) = self.cache.set(&key, &output) {
                        tracing::warn!("⚠️ Not caching output of '{}': {}", node.id, e);
                    }
                }
                result.status = NodeStatus::Completed;
                result.output = Some(output);
                result.attempts = attempts;
            }
            TaskOutcome::Failed { error, code, attempts, .. } => {
                result.status = NodeStatus::Failed;
                result.error = Some(format!("{}: {}", code, error));
                result.attempts = attempts;
            }
            TaskOutcome::Cancelled => {}
        }
        result
    }

    /// Hold admission while memory pressure is critical; false if cancelled meanwhile
    async fn wait_for_memory(&self, cancel: &CancellationToken) -> bool {
        let mut pressure = self.pressure.clone();
        let mut announced = false;
        loop {
            let level = *pressure.borrow_and_update();
            if level != PressureLevel::Critical {
                return true;
            }
            if !announced {
                tracing::warn!("🧯 Memory pressure critical, holding node admission");
                announced = true;
            }
            tokio::select! {
                changed = pressure.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = cancel.cancelled() => return false,
            }
        }
    }
}

/// Build a node's input from its upstream results
///
/// Roots get the execution input. Object outputs merge shallowly in edge
/// order; anything else is keyed by upstream node id. Errs with the first
/// upstream that has no completed result.
fn assemble_input(
    upstream: &[&str],
    finished: &HashMap<String, ExecutionResult>,
    initial: &Value,
) -> std::result::Result<Value, String> {
    if upstream.is_empty() {
        return Ok(initial.clone());
    }

    let mut outputs = Vec::with_capacity(upstream.len());
    for id in upstream {
        match finished.get(*id) {
            Some(result) if result.is_completed() => {
                outputs.push((*id, result.output.clone().unwrap_or(Value::Null)));
            }
            _ => return Err(id.to_string()),
        }
    }

    let mut merged = Map::new();
    if outputs.iter().all(|(_, output)| output.is_object()) {
        for (_, output) in outputs {
            if let Value::Object(fields) = output {
                merged.extend(fields);
            }
        }
    } else {
        for (id, output) in outputs {
            merged.insert(id.to_string(), output);
        }
    }
    Ok(Value::Object(merged))
}

fn cached_result(node_id: &str, output: Value) -> ExecutionResult {
    ExecutionResult {
        output: Some(output),
        cached: true,
        ..ExecutionResult::unrun(node_id, NodeStatus::Completed, None)
    }
}

fn rejected(node_id: &str, task_id: &str, error: &RuntimeError, started: Instant) -> ExecutionResult {
    tracing::warn!("🚫 Node '{}' was not admitted: {}", node_id, error);
    ExecutionResult {
        task_id: Some(task_id.to_string()),
        duration_ms: started.elapsed().as_millis() as u64,
        ..ExecutionResult::unrun(node_id, NodeStatus::Failed, Some(format!("{}: {}", error.code(), error)))
    }
}

/// Error code prefix of a failed result's message
fn failure_code(result: &ExecutionResult) -> String {
    result
        .error
        .as_deref()
        .and_then(|message| message.split_once(": "))
        .map(|(code, _)| code.to_string())
        .unwrap_or_else(|| "EXECUTION_ERROR".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, QueueConfig, RetrySettings};
    use crate::runtime::circuit_breaker::{BreakerConfig, CircuitBreakerRegistry};
    use crate::runtime::dispatcher::executor_fn;
    use crate::runtime::queue::TaskQueue;
    use crate::runtime::retry::RetryPolicy;
    use crate::workflow::catalog::NodeCatalog;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        executor: DistributedExecutor,
        dispatcher: Arc<Dispatcher>,
        pressure: watch::Sender<PressureLevel>,
    }

    fn harness(max_partitions: usize) -> Harness {
        let events = EventBus::default();
        let queue = Arc::new(TaskQueue::new(QueueConfig::default(), events.clone()));
        let settings = RetrySettings {
            initial_delay_ms: 5,
            jitter: false,
            ..RetrySettings::default()
        };
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::from(&settings), events.clone()));
        let dispatcher = Arc::new(Dispatcher::new(queue, breakers, RetryPolicy::from(&settings)));
        dispatcher.start(4);

        let cache = Arc::new(ResultCache::new(CacheConfig::default(), events.clone()));
        let (pressure, rx) = watch::channel(PressureLevel::Normal);
        let config = ExecutorConfig {
            max_partitions_per_level: max_partitions,
            ..ExecutorConfig::default()
        };
        let planner = Planner::new(Arc::new(NodeCatalog::with_builtins()), max_partitions);
        let executor = DistributedExecutor::new(planner, dispatcher.clone(), cache, rx, events, config)
            .with_task_retries(0);
        Harness {
            executor,
            dispatcher,
            pressure,
        }
    }

    fn diamond() -> (Vec<Node>, Vec<Edge>) {
        let nodes = ["a", "b", "c", "d"].map(|id| Node::new(id, "http_request")).to_vec();
        let edges = vec![Edge::new("a", "b"), Edge::new("a", "c"), Edge::new("b", "d"), Edge::new("c", "d")];
        (nodes, edges)
    }

    fn echo() -> Arc<dyn TaskExecutor> {
        executor_fn(|task: Task| async move {
            let mut output = Map::new();
            output.insert(task.node_id, task.input_data);
            Ok(Value::Object(output))
        })
    }

    #[tokio::test]
    async fn test_diamond_runs_all_nodes_and_merges_inputs() {
        let h = harness(2);
        let (nodes, edges) = diamond();
        let plan = h.executor.create_execution_plan("wf", &nodes, &edges).unwrap();
        assert_eq!(plan.level_count(), 3);

        let options = ExecutionOptions {
            input: json!({"seed": 1}),
            ..ExecutionOptions::default()
        };
        let result = h.executor.execute_distributed_with(&plan, echo(), options).await;

        assert!(result.success);
        let all = result.aggregate_results();
        assert_eq!(all.len(), 4);
        assert_eq!(all["a"].output, Some(json!({"a": {"seed": 1}})));
        // b and c both emit objects, so d sees them merged
        let d_output = all["d"].output.clone().unwrap();
        assert!(d_output["d"].get("b").is_some());
        assert!(d_output["d"].get("c").is_some());

        let stats = result.get_execution_stats();
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.success_rate, 1.0);
        h.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_failure_aborts_partition_not_siblings() {
        let h = harness(2);
        let nodes = vec![
            Node::new("ok", "http_request"),
            Node::new("bad", "http_request"),
            Node::new("after_bad", "http_request"),
        ];
        let edges = vec![Edge::new("bad", "after_bad")];
        let plan = h.executor.create_execution_plan("wf", &nodes, &edges).unwrap();

        let exec = executor_fn(|task: Task| async move {
            if task.node_id == "bad" {
                Err(RuntimeError::Execution("HTTP 400 bad request".into()))
            } else {
                Ok(json!({"done": task.node_id}))
            }
        });
        let result = h.executor.execute_distributed(&plan, exec, TaskPriority::High).await;

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].node_id, "bad");
        assert_eq!(result.errors[0].code, "EXECUTION_ERROR");
        assert!(result.result_for("ok").unwrap().is_completed());
        assert_eq!(result.result_for("after_bad").unwrap().status, NodeStatus::Skipped);
        h.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_partition_abort_skips_remaining_nodes() {
        let h = harness(1);
        let nodes = vec![Node::new("x", "http_request"), Node::new("y", "http_request")];
        let plan = h.executor.create_execution_plan("wf", &nodes, &[]).unwrap();
        assert_eq!(plan.partitions.len(), 1);

        let exec = executor_fn(|_task: Task| async { Err(RuntimeError::Execution("forbidden".into())) });
        let result = h.executor.execute_distributed(&plan, exec, TaskPriority::Normal).await;

        let y = result.result_for("y").unwrap();
        assert_eq!(y.status, NodeStatus::Skipped);
        assert!(y.error.as_deref().unwrap().contains("'x'"));
        assert_eq!(result.get_execution_stats().failed, 1);
        h.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_cacheable_nodes_reuse_outputs() {
        let h = harness(2);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let exec = executor_fn(move |_task: Task| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!({"v": 1})) }
        });
        let nodes = vec![Node::new("t", "transform")];
        let plan = h.executor.create_execution_plan("wf", &nodes, &[]).unwrap();

        let first = h.executor.execute_distributed(&plan, exec.clone(), TaskPriority::Normal).await;
        let second = h.executor.execute_distributed(&plan, exec, TaskPriority::Normal).await;

        assert!(first.success && second.success);
        assert!(second.result_for("t").unwrap().cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        h.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_marks_remaining_nodes() {
        let h = harness(1);
        let nodes = vec![Node::new("slow", "http_request"), Node::new("next", "http_request")];
        let plan = h.executor.create_execution_plan("wf", &nodes, &[]).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let exec = executor_fn(move |_task: Task| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Value::Null)
            }
        });

        let result = h
            .executor
            .execute_distributed_with_cancel(&plan, exec, TaskPriority::Normal, cancel)
            .await;

        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.get_execution_stats().cancelled, 2);
        h.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_critical_pressure_holds_admission() {
        let h = harness(1);
        h.pressure.send_replace(PressureLevel::Critical);
        let nodes = vec![Node::new("n", "http_request")];
        let plan = h.executor.create_execution_plan("wf", &nodes, &[]).unwrap();

        let run = h.executor.execute_distributed(&plan, echo(), TaskPriority::Normal);
        tokio::pin!(run);
        let early = tokio::time::timeout(Duration::from_millis(50), &mut run).await;
        assert!(early.is_err());

        h.pressure.send_replace(PressureLevel::Warning);
        assert!(run.await.success);
        h.dispatcher.stop().await;
    }

    #[test]
    fn test_assemble_input_rules() {
        let done = |output: Value| ExecutionResult {
            output: Some(output),
            ..ExecutionResult::unrun("x", NodeStatus::Completed, None)
        };
        let mut finished = HashMap::new();
        finished.insert("a".to_string(), done(json!({"k": 1, "shared": "a"})));
        finished.insert("b".to_string(), done(json!({"shared": "b"})));
        finished.insert("c".to_string(), done(json!(3)));

        let merged = assemble_input(&["a", "b"], &finished, &Value::Null).unwrap();
        assert_eq!(merged, json!({"k": 1, "shared": "b"}));

        let keyed = assemble_input(&["a", "c"], &finished, &Value::Null).unwrap();
        assert_eq!(keyed, json!({"a": {"k": 1, "shared": "a"}, "c": 3}));

        assert_eq!(assemble_input(&[], &finished, &json!("seed")).unwrap(), json!("seed"));
        assert_eq!(assemble_input(&["missing"], &finished, &Value::Null).unwrap_err(), "missing");
    }
}
