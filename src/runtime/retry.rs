/// Backoff-based retry for fallible async operations
///
/// An operation runs at most `max_retries + 1` times. Each failure is first
/// classified: explicit deny patterns win, then explicit allow patterns, then
/// the built-in taxonomy (4xx/auth/validation are permanent; timeouts,
/// connection trouble, 429 and 5xx are transient). Anything unrecognised is
/// treated as transient.

use futures::stream::{self, StreamExt};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackoffKind, RetrySettings};
use crate::error::{Result, RuntimeError};

/// Delay function for the custom strategy: retry index -> delay
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

#[derive(Clone)]
pub enum RetryStrategy {
    /// `initial * factor^attempt`
    Exponential { factor: f64 },
    /// `initial + attempt * increment`
    Linear { increment: Duration },
    /// `fib(attempt + 1) * multiplier`
    Fibonacci { multiplier: Duration },
    Custom(DelayFn),
}

impl std::fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStrategy::Exponential { factor } => f.debug_struct("Exponential").field("factor", factor).finish(),
            RetryStrategy::Linear { increment } => f.debug_struct("Linear").field("increment", increment).finish(),
            RetryStrategy::Fibonacci { multiplier } => {
                f.debug_struct("Fibonacci").field("multiplier", multiplier).finish()
            }
            RetryStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

const DEFAULT_DENY: &[&str] = &[
    "unauthorized",
    "forbidden",
    "permission denied",
    "authentication",
    "invalid",
    "validation",
    "bad request",
    "not found",
];

const DEFAULT_ALLOW: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "econnreset",
    "econnrefused",
    "rate limit",
    "too many requests",
    "unavailable",
    "temporarily",
];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Spread each delay by up to +/-25%
    pub jitter: bool,
    /// Lowercase substrings that force a retry
    pub retryable_errors: Vec<String>,
    /// Lowercase substrings that forbid a retry; checked first
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        let initial_delay = Duration::from_millis(settings.initial_delay_ms);
        let strategy = match settings.strategy {
            BackoffKind::Exponential => RetryStrategy::Exponential {
                factor: settings.factor,
            },
            BackoffKind::Linear => RetryStrategy::Linear {
                increment: initial_delay,
            },
            BackoffKind::Fibonacci => RetryStrategy::Fibonacci {
                multiplier: initial_delay,
            },
        };
        Self {
            max_retries: settings.max_retries,
            strategy,
            initial_delay,
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter,
            retryable_errors: lowercase(&settings.retryable_errors),
            non_retryable_errors: lowercase(&settings.non_retryable_errors),
        }
    }
}

fn lowercase(patterns: &[String]) -> Vec<String> {
    patterns.iter().map(|p| p.to_lowercase()).collect()
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0 for the first retry), capped and jittered
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).min(self.max_delay);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = rand::rng().random_range(-0.25..=0.25);
        base.mul_f64(1.0 + spread)
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        match &self.strategy {
            RetryStrategy::Exponential { factor } => {
                let scale = factor.powi(attempt.min(64) as i32);
                let millis = self.initial_delay.as_millis() as f64 * scale;
                if millis.is_finite() && millis < self.max_delay.as_millis() as f64 {
                    Duration::from_millis(millis as u64)
                } else {
                    self.max_delay
                }
            }
            RetryStrategy::Linear { increment } => self
                .initial_delay
                .saturating_add(increment.saturating_mul(attempt)),
            RetryStrategy::Fibonacci { multiplier } => multiplier.saturating_mul(fibonacci(attempt + 1)),
            RetryStrategy::Custom(delay) => delay(attempt),
        }
    }

    /// Whether an error is worth another attempt
    pub fn is_retryable(&self, error: &RuntimeError) -> bool {
        let message = error.to_string().to_lowercase();

        if self.non_retryable_errors.iter().any(|p| message.contains(p)) {
            return false;
        }
        if self.retryable_errors.iter().any(|p| message.contains(p)) {
            return true;
        }
        match error {
            RuntimeError::Execution(_) => classify_message(&message),
            other => other.is_retryable(),
        }
    }
}

/// Default taxonomy for free-form executor messages
fn classify_message(message: &str) -> bool {
    if let Some(status) = http_status_in(message) {
        return status == 429 || status >= 500;
    }
    if DEFAULT_DENY.iter().any(|p| message.contains(p)) {
        return false;
    }
    if DEFAULT_ALLOW.iter().any(|p| message.contains(p)) {
        return true;
    }
    true
}

/// Status code following an `http`, `status` or `code` marker, if any
fn http_status_in(message: &str) -> Option<u16> {
    let words: Vec<&str> = message
        .split(|c: char| c.is_whitespace() || c == ':' || c == '=')
        .filter(|w| !w.is_empty())
        .collect();
    words.windows(2).find_map(|pair| {
        let marker = pair[0].trim_matches(|c: char| !c.is_ascii_alphanumeric());
        if !matches!(marker, "http" | "status" | "code") {
            return None;
        }
        let code: u16 = pair[1]
            .trim_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .ok()?;
        (400..600).contains(&code).then_some(code)
    })
}

fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (0u32, 1u32);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Invocations performed, including the first
    pub attempts: u32,
    pub total_delay: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `operation` until it succeeds, fails permanently, or retries run out
///
/// The closure receives the zero-based attempt number.
pub async fn execute_with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut total_delay = Duration::ZERO;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    total_delay,
                }
            }
            Err(error) => {
                let exhausted = attempt >= policy.max_retries;
                if exhausted || !policy.is_retryable(&error) {
                    if !exhausted {
                        tracing::debug!("⛔ Not retrying permanent error: {}", error);
                    }
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt + 1,
                        total_delay,
                    };
                }

                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    "🔁 Attempt {} failed ({}), retrying in {:?}",
                    attempt + 1,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                total_delay += delay;
                attempt += 1;
            }
        }
    }
}

/// Retry a batch of independent operations with bounded concurrency
///
/// Outcomes come back in input order; one failure never aborts the batch.
pub async fn bulk_retry<F, Fut, T>(
    operations: Vec<F>,
    policy: &RetryPolicy,
    concurrency: usize,
) -> Vec<RetryOutcome<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    stream::iter(operations)
        .map(|operation| execute_with_retry(policy, operation))
        .buffered(concurrency.max(1))
        .collect()
        .await
}
