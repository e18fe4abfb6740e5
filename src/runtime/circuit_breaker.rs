/// Consecutive-failure circuit breakers
///
/// Closed while calls succeed. After `threshold` consecutive failures the
/// breaker opens and rejects without invoking anything. Once `reset_timeout`
/// has elapsed a single trial call is let through (half-open): success closes
/// the breaker, failure reopens it and restarts the cooldown. A trial that is
/// abandoned before finishing hands the next caller a fresh trial.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RetrySettings;
use crate::error::{Result, RuntimeError};
use crate::runtime::events::{EventBus, RuntimeEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub threshold: u32,
    /// Upper bound on a single guarded call
    pub timeout: Duration,
    /// Cooldown before the half-open trial
    pub reset_timeout: Duration,
}

impl From<&RetrySettings> for BreakerConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            threshold: settings.breaker_threshold,
            timeout: Duration::from_millis(settings.breaker_timeout_ms),
            reset_timeout: Duration::from_millis(settings.breaker_reset_timeout_ms),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    events: EventBus,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, events: EventBus) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Admit a call or fail fast; flips open -> half-open once the cooldown is over.
    /// Returns whether the admitted call is the half-open trial.
    fn admit(&self) -> Result<bool> {
        let mut trial = false;
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let cooled = s
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if !cooled {
                    s.rejected_calls += 1;
                    return Err(self.open_error());
                }
                tracing::info!("🔦 Circuit '{}' half-open, letting one trial through", self.name);
                s.state = CircuitState::HalfOpen;
                trial = true;
            }
            // The trial call is still running
            CircuitState::HalfOpen => {
                s.rejected_calls += 1;
                return Err(self.open_error());
            }
        }
        s.total_calls += 1;
        Ok(trial)
    }

    /// Back to open with the cooldown already served, so the next call is a new trial
    fn abandon_trial(&self) {
        let mut s = self.state.lock();
        if s.state == CircuitState::HalfOpen {
            tracing::debug!("🔦 Circuit '{}' trial call was dropped", self.name);
            s.state = CircuitState::Open;
        }
    }

    fn open_error(&self) -> RuntimeError {
        RuntimeError::CircuitOpen {
            name: self.name.clone(),
        }
    }

    pub fn record_success(&self) {
        let closed_now = {
            let mut s = self.state.lock();
            s.successful_calls += 1;
            s.consecutive_failures = 0;
            let was_open = s.state != CircuitState::Closed;
            s.state = CircuitState::Closed;
            s.opened_at = None;
            was_open
        };
        if closed_now {
            tracing::info!("✅ Circuit '{}' closed", self.name);
            self.events.emit(RuntimeEvent::CircuitClosed { name: self.name.clone() });
        }
    }

    pub fn record_failure(&self) {
        let opened_now = {
            let mut s = self.state.lock();
            s.failed_calls += 1;
            s.consecutive_failures += 1;
            let trip = s.state == CircuitState::HalfOpen
                || (s.state == CircuitState::Closed && s.consecutive_failures >= self.config.threshold);
            if trip {
                s.state = CircuitState::Open;
                s.opened_at = Some(Instant::now());
            }
            trip
        };
        if opened_now {
            tracing::warn!("🚧 Circuit '{}' opened", self.name);
            self.events.emit(RuntimeEvent::CircuitOpened { name: self.name.clone() });
        }
    }

    /// Run `operation` through the breaker, bounded by the call timeout
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut pending = PendingTrial {
            breaker: self,
            armed: self.admit()?,
        };

        let outcome = match tokio::time::timeout(self.config.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::TaskTimeout {
                task_id: self.name.clone(),
                timeout_ms: self.config.timeout.as_millis() as u64,
            }),
        };

        pending.armed = false;
        match &outcome {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        outcome
    }

    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.opened_at = None;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let s = self.state.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            total_calls: s.total_calls,
            successful_calls: s.successful_calls,
            failed_calls: s.failed_calls,
            rejected_calls: s.rejected_calls,
        }
    }
}

/// Half-open trial in flight; reopens the trial slot if dropped unfinished
struct PendingTrial<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for PendingTrial<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}

/// An operation bundled with its own breaker
pub struct GuardedOperation<F> {
    operation: F,
    breaker: CircuitBreaker,
}

impl<F, Fut, T> GuardedOperation<F>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    pub async fn call(&self) -> Result<T> {
        self.breaker.execute(&self.operation).await
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

/// Wrap `operation` so every call goes through a fresh breaker
pub fn create_circuit_breaker<F>(
    name: impl Into<String>,
    operation: F,
    config: BreakerConfig,
    events: EventBus,
) -> GuardedOperation<F> {
    GuardedOperation {
        operation,
        breaker: CircuitBreaker::new(name, config, events),
    }
}

/// One breaker per key (node type), created on first use
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig, events: EventBus) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config, self.events.clone())))
            .clone()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self.breakers.lock().values().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> BreakerConfig {
        BreakerConfig {
            threshold: 3,
            timeout: Duration::from_secs(1),
            reset_timeout: Duration::from_millis(500),
        }
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        breaker
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RuntimeError::Execution("HTTP 503".into()))
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("http_request", config(), EventBus::default());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(fail(&breaker, &calls).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = fail(&breaker, &calls).await.unwrap_err();
        assert!(matches!(err, RuntimeError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.snapshot().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_closes_or_reopens() {
        let breaker = CircuitBreaker::new("db", config(), EventBus::default());
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&breaker, &calls).await;
        }

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(fail(&breaker, &calls).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(600)).await;
        let value = breaker.execute(|| async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_lets_next_call_through() {
        let breaker = CircuitBreaker::new("db", config(), EventBus::default());
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&breaker, &calls).await;
        }
        tokio::time::advance(Duration::from_millis(600)).await;

        let mut trial = Box::pin(breaker.execute(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }));
        assert!(futures::poll!(&mut trial).is_pending());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        drop(trial);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.execute(|| async { Ok(7) }).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_counts_as_failure() {
        let breaker = CircuitBreaker::new("slow", config(), EventBus::default());
        let err = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TASK_TIMEOUT");
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_guarded_operation_and_registry() {
        let guarded = create_circuit_breaker("ping", || async { Ok("pong") }, config(), EventBus::default());
        assert_eq!(guarded.call().await.unwrap(), "pong");
        assert_eq!(guarded.breaker().snapshot().successful_calls, 1);

        let registry = CircuitBreakerRegistry::new(config(), EventBus::default());
        let a = registry.get_or_create("http_request");
        let b = registry.get_or_create("http_request");
        assert!(Arc::ptr_eq(&a, &b));
        registry.get_or_create("ai_agent");
        let names: Vec<String> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["ai_agent", "http_request"]);
    }
}
