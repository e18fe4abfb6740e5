//! End-to-end scenarios driven through the public API

use axum::{routing::post, Json, Router};
use flowgrid::config::{CacheConfig, Config, QueueConfig};
use flowgrid::runtime::cache::ResultCache;
use flowgrid::runtime::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use flowgrid::runtime::queue::TaskQueue;
use flowgrid::runtime::retry::{execute_with_retry, RetryPolicy};
use flowgrid::runtime::{executor_fn, EventBus, NodeStatus};
use flowgrid::{Edge, Node, Runtime, RuntimeError, Task, TaskPriority};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn test_config() -> Config {
    let mut config = Config::default();
    config.memory.enabled = false;
    config.executor.workers = 4;
    config.executor.max_partitions_per_level = 2;
    config.retry.initial_delay_ms = 5;
    config.retry.jitter = false;
    config
}

fn diamond() -> (Vec<Node>, Vec<Edge>) {
    let nodes = vec![
        Node::new("A", "http_request"),
        Node::new("B", "http_request"),
        Node::new("C", "http_request"),
        Node::new("D", "http_request"),
    ];
    let edges = vec![
        Edge::new("A", "B"),
        Edge::new("A", "C"),
        Edge::new("B", "D"),
        Edge::new("C", "D"),
    ];
    (nodes, edges)
}

fn level_members(plan: &flowgrid::ExecutionPlan, level: usize) -> Vec<String> {
    let mut ids: Vec<String> = plan
        .partitions
        .iter()
        .filter(|p| p.level == level)
        .flat_map(|p| p.node_ids().map(str::to_string))
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn diamond_plans_three_levels_and_succeeds() {
    let runtime = Runtime::start(test_config()).unwrap();
    let (nodes, edges) = diamond();
    let plan = runtime.create_execution_plan("wf-diamond", &nodes, &edges).unwrap();

    assert_eq!(plan.level_count(), 3);
    assert_eq!(level_members(&plan, 0), ["A"]);
    assert_eq!(level_members(&plan, 1), ["B", "C"]);
    assert_eq!(level_members(&plan, 2), ["D"]);

    let exec = executor_fn(|task: Task| async move { Ok(json!({ "ran": task.node_id })) });
    let result = runtime.execute_distributed(&plan, exec, TaskPriority::Normal).await;

    assert!(result.success);
    let all = result.aggregate_results();
    let ids: Vec<&str> = all.keys().map(String::as_str).collect();
    assert_eq!(ids, ["A", "B", "C", "D"]);
    assert!(all.values().all(|r| r.status == NodeStatus::Completed));
    runtime.shutdown().await;
}

#[tokio::test]
async fn queue_drains_by_priority() {
    let queue = TaskQueue::new(QueueConfig::default(), EventBus::default());
    for (node, priority) in [("low", TaskPriority::Low), ("critical", TaskPriority::Critical), ("normal", TaskPriority::Normal)] {
        let task = Task::new("wf", Node::new(node, "transform"), Value::Null).with_priority(priority);
        assert!(queue.enqueue(task));
    }

    let order: Vec<String> = std::iter::from_fn(|| queue.dequeue()).map(|t| t.node_id).collect();
    assert_eq!(order, ["critical", "normal", "low"]);
}

#[tokio::test(start_paused = true)]
async fn dedup_window_admits_after_expiry() {
    let config = QueueConfig {
        deduplication_window_ms: 1_000,
        ..QueueConfig::default()
    };
    let queue = TaskQueue::new(config, EventBus::default());
    let task = || Task::new("wf", Node::new("n", "transform"), json!({"x": 1}));

    assert!(queue.enqueue(task()));
    assert!(!queue.enqueue(task()));
    assert_eq!(queue.pending_len(), 1);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    assert!(queue.enqueue(task()));
    assert_eq!(queue.pending_len(), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_invokes_exactly_n_plus_one_times() {
    let policy = RetryPolicy::default().with_max_retries(4).without_jitter();
    let calls = AtomicU32::new(0);
    let calls = &calls;

    let outcome = execute_with_retry(&policy, move |_| async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(RuntimeError::Execution("connection refused".into()))
    })
    .await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.attempts, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn breaker_rejects_until_reset_timeout() {
    let config = BreakerConfig {
        threshold: 2,
        timeout: Duration::from_secs(1),
        reset_timeout: Duration::from_secs(10),
    };
    let breaker = CircuitBreaker::new("db", config, EventBus::default());
    let calls = AtomicU32::new(0);
    let calls = &calls;
    let failing = || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(RuntimeError::Execution("HTTP 502".into()))
    };

    let _ = breaker.execute(failing).await;
    let _ = breaker.execute(failing).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(matches!(breaker.execute(failing).await, Err(RuntimeError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(breaker.execute(|| async { Ok(1) }).await.unwrap(), 1);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn cache_stays_within_bounds() {
    let config = CacheConfig {
        max_entries: 8,
        max_size_mb: 1,
        compression_threshold: 256,
        ..CacheConfig::default()
    };
    let cache = ResultCache::new(config, EventBus::default());

    for i in 0..200 {
        let value = json!({ "i": i, "blob": "x".repeat(20_000 + i) });
        cache.set(&format!("k{i}"), &value).unwrap();
        assert!(cache.len() <= 8);
        assert!(cache.total_bytes() <= 1024 * 1024);
    }

    let last: Value = cache.get("k199").unwrap();
    assert_eq!(last["i"], 199);
    assert!(cache.metrics().evictions > 0);
}

#[tokio::test]
async fn failing_partition_leaves_siblings_running() {
    let runtime = Runtime::start(test_config()).unwrap();
    let nodes = vec![
        Node::new("left", "http_request"),
        Node::new("right", "http_request"),
        Node::new("after_left", "http_request"),
        Node::new("after_right", "http_request"),
    ];
    let edges = vec![Edge::new("left", "after_left"), Edge::new("right", "after_right")];
    let plan = runtime.create_execution_plan("wf-isolation", &nodes, &edges).unwrap();

    let exec = executor_fn(|task: Task| async move {
        if task.node_id == "left" {
            Err(RuntimeError::Execution("HTTP 422 invalid payload".into()))
        } else {
            Ok(json!({ "ok": task.node_id }))
        }
    });
    let result = runtime.execute_distributed(&plan, exec, TaskPriority::High).await;

    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].node_id, "left");

    let stats = result.get_execution_stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(result.result_for("after_right").unwrap().status, NodeStatus::Completed);
    runtime.shutdown().await;
}

#[tokio::test]
async fn cancellation_stops_remaining_levels() {
    let runtime = Runtime::start(test_config()).unwrap();
    let (nodes, edges) = diamond();
    let plan = runtime.create_execution_plan("wf-cancel", &nodes, &edges).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let exec = executor_fn(move |task: Task| {
        let trigger = trigger.clone();
        async move {
            if task.node_id == "A" {
                trigger.cancel();
            }
            Ok(Value::Null)
        }
    });

    let result = runtime
        .execute_distributed_with_cancel(&plan, exec, TaskPriority::Normal, cancel)
        .await;

    assert!(result.cancelled);
    assert_eq!(result.result_for("D").unwrap().status, NodeStatus::Cancelled);
    runtime.shutdown().await;
}

#[tokio::test]
async fn cyclic_graph_reports_unscheduled_nodes() {
    let runtime = Runtime::start(test_config()).unwrap();
    let nodes = vec![Node::new("root", "trigger"), Node::new("x", "code"), Node::new("y", "code")];
    let edges = vec![Edge::new("root", "x"), Edge::new("x", "y"), Edge::new("y", "x")];
    let plan = runtime.create_execution_plan("wf-cycle", &nodes, &edges).unwrap();
    assert!(!plan.is_complete());

    let exec = executor_fn(|_task: Task| async { Ok(Value::Null) });
    let result = runtime.execute_distributed(&plan, exec, TaskPriority::Normal).await;

    assert!(result.result_for("root").unwrap().is_completed());
    let mut unscheduled: Vec<&str> = result.errors.iter().map(|e| e.node_id.as_str()).collect();
    unscheduled.sort();
    assert_eq!(unscheduled, ["x", "y"]);
    runtime.shutdown().await;
}

#[tokio::test]
async fn http_api_runs_workflow_through_callback() {
    // Graph owner's callback endpoint
    let hook = Router::new().route(
        "/hook",
        post(|Json(task): Json<Value>| async move { Json(json!({ "ran": task["node_id"] })) }),
    );
    let hook_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hook_addr = hook_listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(hook_listener, hook).await.unwrap() });

    let runtime = Runtime::start(test_config()).unwrap();
    let app = flowgrid::server::create_app(runtime.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let client = reqwest::Client::new();
    let health = client.get(format!("http://{addr}/healthz")).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "ok");

    let (nodes, edges) = diamond();
    let body = json!({
        "workflow_id": "wf-http",
        "nodes": nodes,
        "edges": edges,
        "priority": "high",
        "callback_url": format!("http://{hook_addr}/hook"),
    });
    let response: Value = client
        .post(format!("http://{addr}/api/executions"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["result"]["success"], true);
    assert_eq!(response["stats"]["completed"], 4);

    let bad = json!({ "workflow_id": "wf-bad", "nodes": [{ "id": "n", "node_type": "teleport" }] });
    let rejected = client
        .post(format!("http://{addr}/api/plans"))
        .json(&bad)
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), reqwest::StatusCode::BAD_REQUEST);

    let metrics: Value = client
        .get(format!("http://{addr}/api/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["queue"]["total_completed"], 4);
    runtime.shutdown().await;
}
