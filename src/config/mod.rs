/// Configuration management for the flowgrid runtime
///
/// Every knob is optional and defaulted. Defaults honour a handful of
/// FLOWGRID_* environment variables for container deployment, and a TOML file
/// can override any subset of fields.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::workflow::types::TaskPriority;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Task queue configuration
    pub queue: QueueConfig,
    /// Result cache configuration
    pub cache: CacheConfig,
    /// Outbound connection pool configuration
    pub pool: PoolConfig,
    /// Retry policy applied to node executor calls
    pub retry: RetrySettings,
    /// Memory monitor configuration
    pub memory: MemoryConfig,
    /// Partition executor configuration
    pub executor: ExecutorConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
    /// Fallback log filter when RUST_LOG is unset
    pub log_level: String,
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued (not yet dequeued) tasks
    pub max_queue_size: usize,
    /// Relative weight of each priority tier, used for the weighted backlog metric
    pub priority_weights: HashMap<TaskPriority, u32>,
    /// Default per-task timeout in milliseconds
    pub task_timeout_ms: u64,
    /// Drop tasks whose fingerprint was enqueued within the dedup window
    pub enable_deduplication: bool,
    /// Deduplication window in milliseconds
    pub deduplication_window_ms: u64,
    /// Terminal tasks kept for lookups after completion
    pub max_history: usize,
}

/// Eviction policy for the result cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Oldest last access goes first
    Lru,
    /// Lowest hit count goes first
    Lfu,
    /// Oldest insertion goes first
    Fifo,
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum resident size in megabytes
    pub max_size_mb: usize,
    /// Maximum number of resident entries
    pub max_entries: usize,
    /// Default time-to-live in milliseconds
    pub ttl_ms: u64,
    /// Eviction policy applied when a ceiling would be exceeded
    pub eviction_policy: EvictionPolicy,
    /// Compress serialized values above the threshold
    pub compression_enabled: bool,
    /// Compression threshold in bytes
    pub compression_threshold: usize,
    /// Background expiry sweep interval in milliseconds
    pub sweep_interval_ms: u64,
}

/// Outbound connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub http: HttpPoolConfig,
    pub database: DatabasePoolConfig,
    /// Idle sweep interval in milliseconds
    pub sweep_interval_ms: u64,
}

/// HTTP agent configuration (one agent per scheme://host:port)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpPoolConfig {
    /// Idle keep-alive sockets kept per origin
    pub max_connections: usize,
    /// Enable TCP keep-alive on agent sockets
    pub keep_alive: bool,
    /// Idle time before an agent is closed, in milliseconds
    pub keep_alive_timeout_ms: u64,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
}

/// Database handle pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabasePoolConfig {
    /// Connection URL handed to the connector
    pub url: String,
    /// Maximum number of concurrently open handles
    pub max_connections: usize,
    /// Idle time before a handle is closed, in milliseconds
    pub idle_timeout_ms: u64,
    /// Time a caller may wait for a free handle, in milliseconds
    pub connection_timeout_ms: u64,
}

/// Backoff strategy selector as it appears in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Linear,
    Fibonacci,
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub strategy: BackoffKind,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    pub jitter: bool,
    /// Message fragments that force a retry
    pub retryable_errors: Vec<String>,
    /// Message fragments that forbid a retry
    pub non_retryable_errors: Vec<String>,
    /// Consecutive failures before a node-type circuit opens
    pub breaker_threshold: u32,
    /// Per-call timeout enforced by the breaker, in milliseconds
    pub breaker_timeout_ms: u64,
    /// Time an open breaker waits before a trial call, in milliseconds
    pub breaker_reset_timeout_ms: u64,
}

/// Memory monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// Sampling interval in milliseconds
    pub sample_interval_ms: u64,
    /// Samples kept in the rolling window
    pub window_size: usize,
    /// Resident memory (MB) that triggers a warning
    pub warning_threshold_mb: u64,
    /// Resident memory (MB) that triggers collection and back-pressure
    pub critical_threshold_mb: u64,
    /// Sustained growth (MB per minute) reported as a probable leak
    pub leak_growth_mb_per_min: f64,
}

/// Partition executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker loops draining the task queue
    pub workers: usize,
    /// Upper bound on partitions created per level
    pub max_partitions_per_level: usize,
    /// Reuse cached outputs of cacheable node types
    pub use_cache: bool,
}

impl Default for ServerConfig {
    /// Default server configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            host: std::env::var("FLOWGRID_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("FLOWGRID_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3005),
            log_level: std::env::var("FLOWGRID_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let priority_weights = HashMap::from([
            (TaskPriority::Critical, 8),
            (TaskPriority::High, 4),
            (TaskPriority::Normal, 2),
            (TaskPriority::Low, 1),
        ]);
        Self {
            max_queue_size: 10_000,
            priority_weights,
            task_timeout_ms: 30_000,
            enable_deduplication: true,
            deduplication_window_ms: 5_000,
            max_history: 1_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 100,
            max_entries: 10_000,
            ttl_ms: 3_600_000,
            eviction_policy: EvictionPolicy::Lru,
            compression_enabled: true,
            compression_threshold: 1024,
            sweep_interval_ms: 60_000,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            http: HttpPoolConfig::default(),
            database: DatabasePoolConfig::default(),
            sweep_interval_ms: 60_000,
        }
    }
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            keep_alive: true,
            keep_alive_timeout_ms: 30_000,
            timeout_ms: 30_000,
        }
    }
}

impl Default for DatabasePoolConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("FLOWGRID_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite::memory:".to_string()),
            max_connections: 10,
            idle_timeout_ms: 300_000,
            connection_timeout_ms: 5_000,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffKind::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: true,
            retryable_errors: Vec::new(),
            non_retryable_errors: Vec::new(),
            breaker_threshold: 5,
            breaker_timeout_ms: 60_000,
            breaker_reset_timeout_ms: 30_000,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 10_000,
            window_size: 30,
            warning_threshold_mb: 512,
            critical_threshold_mb: 1024,
            leak_growth_mb_per_min: 50.0,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: std::env::var("FLOWGRID_WORKERS")
                .ok()
                .and_then(|w| w.parse().ok())
                .unwrap_or(8),
            max_partitions_per_level: 4,
            use_cache: true,
        }
    }
}

impl Config {
    /// Parse a configuration from TOML text; missing fields keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)
            .map_err(|e| RuntimeError::Config(format!("invalid TOML configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("📄 Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load from FLOWGRID_CONFIG when set, otherwise use validated defaults
    pub fn load_from_env() -> Result<Self> {
        match std::env::var("FLOWGRID_CONFIG") {
            Ok(path) if !path.is_empty() => Self::load(path),
            _ => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Reject configurations the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(RuntimeError::Config(msg.to_string()));

        if self.queue.max_queue_size == 0 {
            return fail("queue.max_queue_size must be greater than zero");
        }
        if self.cache.max_entries == 0 || self.cache.max_size_mb == 0 {
            return fail("cache.max_entries and cache.max_size_mb must be greater than zero");
        }
        if self.pool.http.max_connections == 0 || self.pool.database.max_connections == 0 {
            return fail("pool max_connections must be greater than zero");
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return fail("retry.max_delay_ms must not be below retry.initial_delay_ms");
        }
        if self.retry.factor < 1.0 {
            return fail("retry.factor must be at least 1.0");
        }
        if self.retry.breaker_threshold == 0 {
            return fail("retry.breaker_threshold must be greater than zero");
        }
        if self.memory.warning_threshold_mb > self.memory.critical_threshold_mb {
            return fail("memory.warning_threshold_mb must not exceed memory.critical_threshold_mb");
        }
        if self.memory.window_size < 2 {
            return fail("memory.window_size must hold at least two samples");
        }
        if self.cache.sweep_interval_ms == 0
            || self.pool.sweep_interval_ms == 0
            || self.memory.sample_interval_ms == 0
        {
            return fail("sweep and sample intervals must be greater than zero");
        }
        if self.executor.workers == 0 || self.executor.max_partitions_per_level == 0 {
            return fail("executor.workers and executor.max_partitions_per_level must be greater than zero");
        }
        Ok(())
    }
}

impl CacheConfig {
    /// Resident size ceiling in bytes
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.eviction_policy, EvictionPolicy::Lru);
        assert_eq!(config.queue.priority_weights[&TaskPriority::Critical], 8);
        assert_eq!(config.cache.max_size_bytes(), 100 * 1024 * 1024);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [cache]
            eviction_policy = "lfu"
            max_entries = 16

            [retry]
            strategy = "fibonacci"
            max_retries = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.eviction_policy, EvictionPolicy::Lfu);
        assert_eq!(config.cache.max_entries, 16);
        assert_eq!(config.cache.max_size_mb, 100);
        assert_eq!(config.retry.strategy, BackoffKind::Fibonacci);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.queue.max_queue_size, 10_000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_toml_str("[queue]\nmax_queue_size = 0\n").unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));

        let err = Config::from_toml_str(
            "[memory]\nwarning_threshold_mb = 900\ncritical_threshold_mb = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("warning_threshold_mb"));

        assert!(Config::from_toml_str("[cache]\neviction_policy = \"random\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[executor]\nworkers = 2\nmax_partitions_per_level = 3").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.executor.workers, 2);
        assert_eq!(config.executor.max_partitions_per_level, 3);
    }
}
