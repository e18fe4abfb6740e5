/// Memory monitor and back-pressure source
///
/// Samples process memory on a fixed interval into a rolling window and
/// classifies it as normal, warning or critical. While critical it runs an
/// aggressive collection pass over the registered reclaimers and publishes
/// `PressureLevel::Critical` on a watch channel; the executor holds new node
/// admissions until the level drops. Sustained growth above the configured
/// rate is reported as a probable leak and nothing more.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::MemoryConfig;
use crate::runtime::events::{EventBus, RuntimeEvent};

/// Something that can give memory back on demand
pub trait Reclaim: Send + Sync {
    fn name(&self) -> &str;

    /// Free what can be freed; returns a count of entries or bytes released
    fn reclaim(&self) -> usize;
}

/// Source of resident memory readings
pub trait MemorySampler: Send + Sync {
    /// Resident bytes, or `None` when the platform offers no reading
    fn sample_bytes(&self) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`
#[derive(Debug, Default)]
pub struct ProcessMemorySampler;

impl MemorySampler for ProcessMemorySampler {
    fn sample_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        status
            .lines()
            .find(|line| line.starts_with("VmRSS:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    used_mb: f64,
}

#[derive(Debug, Default)]
struct Window {
    samples: VecDeque<Sample>,
    leak_flagged: bool,
    gc_runs: u64,
    reclaimed_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryMetrics {
    pub current_mb: f64,
    pub level: PressureLevel,
    pub growth_mb_per_min: f64,
    pub samples: usize,
    pub gc_runs: u64,
    pub reclaimed_total: u64,
}

pub struct MemoryOptimizer {
    config: MemoryConfig,
    sampler: Arc<dyn MemorySampler>,
    reclaimers: Mutex<Vec<Arc<dyn Reclaim>>>,
    window: Mutex<Window>,
    pressure: watch::Sender<PressureLevel>,
    events: EventBus,
}

impl std::fmt::Debug for MemoryOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryOptimizer")
            .field("config", &self.config)
            .field("level", &*self.pressure.borrow())
            .finish()
    }
}

impl MemoryOptimizer {
    pub fn new(config: MemoryConfig, events: EventBus) -> Self {
        Self::with_sampler(config, events, Arc::new(ProcessMemorySampler))
    }

    pub fn with_sampler(
        config: MemoryConfig,
        events: EventBus,
        sampler: Arc<dyn MemorySampler>,
    ) -> Self {
        let (pressure, _) = watch::channel(PressureLevel::Normal);
        Self {
            config,
            sampler,
            reclaimers: Mutex::new(Vec::new()),
            window: Mutex::new(Window::default()),
            pressure,
            events,
        }
    }

    pub fn register(&self, reclaimer: Arc<dyn Reclaim>) {
        tracing::debug!("🧹 Registered reclaimer '{}'", reclaimer.name());
        self.reclaimers.lock().push(reclaimer);
    }

    /// Back-pressure channel; the executor waits while it reads `Critical`
    pub fn pressure(&self) -> watch::Receiver<PressureLevel> {
        self.pressure.subscribe()
    }

    pub fn level(&self) -> PressureLevel {
        *self.pressure.borrow()
    }

    /// Take one sample, classify it and react; `None` when no reading exists
    pub fn sample_now(&self) -> Option<PressureLevel> {
        let used_mb = self.sampler.sample_bytes()? as f64 / (1024.0 * 1024.0);
        let now = Instant::now();

        let growth = {
            let mut window = self.window.lock();
            window.samples.push_back(Sample { at: now, used_mb });
            while window.samples.len() > self.config.window_size {
                window.samples.pop_front();
            }
            growth_rate(&window.samples)
        };

        let level = if used_mb >= self.config.critical_threshold_mb as f64 {
            PressureLevel::Critical
        } else if used_mb >= self.config.warning_threshold_mb as f64 {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        };

        let previous = self.level();
        if level != previous {
            match level {
                PressureLevel::Critical => {
                    tracing::error!("🔥 Memory critical: {:.1} MB", used_mb);
                    self.events.emit(RuntimeEvent::MemoryCritical { used_mb });
                }
                PressureLevel::Warning if previous == PressureLevel::Normal => {
                    tracing::warn!("⚠️ Memory warning: {:.1} MB", used_mb);
                    self.events.emit(RuntimeEvent::MemoryWarning { used_mb });
                }
                _ => tracing::info!("🌤️ Memory pressure eased to {:?} ({:.1} MB)", level, used_mb),
            }
        }

        if level == PressureLevel::Critical {
            self.collect();
        }
        self.pressure.send_replace(level);

        self.check_leak(growth);
        Some(level)
    }

    /// Aggressive collection pass over every registered reclaimer
    pub fn collect(&self) -> usize {
        let started = Instant::now();
        let reclaimers: Vec<Arc<dyn Reclaim>> = self.reclaimers.lock().clone();

        let reclaimed: usize = reclaimers
            .iter()
            .map(|r| {
                let freed = r.reclaim();
                tracing::debug!("🧹 {} reclaimed {}", r.name(), freed);
                freed
            })
            .sum();

        {
            let mut window = self.window.lock();
            window.gc_runs += 1;
            window.reclaimed_total += reclaimed as u64;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!("♻️ Collection pass reclaimed {} in {}ms", reclaimed, duration_ms);
        self.events.emit(RuntimeEvent::GcCompleted {
            reclaimed,
            duration_ms,
        });
        reclaimed
    }

    fn check_leak(&self, growth: Option<f64>) {
        let Some(growth) = growth else { return };
        let sustained = growth > self.config.leak_growth_mb_per_min;

        let newly_flagged = {
            let mut window = self.window.lock();
            let newly = sustained && !window.leak_flagged;
            window.leak_flagged = sustained;
            newly
        };

        if newly_flagged {
            tracing::warn!("🕳️ Probable memory leak: growing {:.1} MB/min", growth);
            self.events.emit(RuntimeEvent::MemoryLeakDetected {
                growth_mb_per_min: growth,
            });
        }
    }

    pub fn metrics(&self) -> MemoryMetrics {
        let window = self.window.lock();
        MemoryMetrics {
            current_mb: window.samples.back().map(|s| s.used_mb).unwrap_or(0.0),
            level: self.level(),
            growth_mb_per_min: growth_rate(&window.samples).unwrap_or(0.0),
            samples: window.samples.len(),
            gc_runs: window.gc_runs,
            reclaimed_total: window.reclaimed_total,
        }
    }

    /// Sample on the configured interval until cancelled
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(self.config.sample_interval_ms));
            tracing::info!("🩺 Memory monitor started ({}ms interval)", self.config.sample_interval_ms);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.sample_now().is_none() {
                            tracing::trace!("No memory reading available on this platform");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            tracing::info!("🩺 Memory monitor stopped");
        })
    }
}

/// MB per minute between the oldest and newest sample of the window
fn growth_rate(samples: &VecDeque<Sample>) -> Option<f64> {
    let (first, last) = (samples.front()?, samples.back()?);
    let minutes = last.at.duration_since(first.at).as_secs_f64() / 60.0;
    if samples.len() < 2 || minutes <= 0.0 {
        return None;
    }
    Some((last.used_mb - first.used_mb) / minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MB: u64 = 1024 * 1024;

    struct Scripted(Mutex<VecDeque<u64>>);

    impl Scripted {
        fn new(mbs: &[u64]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(mbs.iter().map(|mb| mb * MB).collect())))
        }
    }

    impl MemorySampler for Scripted {
        fn sample_bytes(&self) -> Option<u64> {
            self.0.lock().pop_front()
        }
    }

    struct Counting(AtomicUsize);

    impl Reclaim for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn reclaim(&self) -> usize {
            self.0.fetch_add(1, Ordering::SeqCst);
            7
        }
    }

    fn config() -> MemoryConfig {
        MemoryConfig {
            warning_threshold_mb: 100,
            critical_threshold_mb: 200,
            leak_growth_mb_per_min: 50.0,
            window_size: 5,
            ..MemoryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_levels_and_collection() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let optimizer = MemoryOptimizer::with_sampler(config(), events, Scripted::new(&[50, 150, 250, 60]));
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        optimizer.register(counting.clone());
        let pressure = optimizer.pressure();

        assert_eq!(optimizer.sample_now(), Some(PressureLevel::Normal));
        assert_eq!(optimizer.sample_now(), Some(PressureLevel::Warning));
        assert_eq!(optimizer.sample_now(), Some(PressureLevel::Critical));
        assert_eq!(*pressure.borrow(), PressureLevel::Critical);
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);

        assert_eq!(optimizer.sample_now(), Some(PressureLevel::Normal));
        assert_eq!(*pressure.borrow(), PressureLevel::Normal);
        assert_eq!(optimizer.sample_now(), None);

        let names: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(names, ["memory_warning", "memory_critical", "gc_completed"]);
        assert_eq!(optimizer.metrics().reclaimed_total, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leak_detected_once_while_sustained() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let optimizer = MemoryOptimizer::with_sampler(config(), events, Scripted::new(&[10, 70, 90, 95]));

        optimizer.sample_now();
        tokio::time::advance(Duration::from_secs(60)).await;
        optimizer.sample_now();
        tokio::time::advance(Duration::from_secs(60)).await;
        optimizer.sample_now();

        let leak = rx.try_recv().unwrap();
        assert_eq!(leak, RuntimeEvent::MemoryLeakDetected { growth_mb_per_min: 60.0 });
        assert!(rx.try_recv().is_err());

        // 85 MB over three minutes drops below the threshold
        tokio::time::advance(Duration::from_secs(60)).await;
        optimizer.sample_now();
        assert!(optimizer.metrics().growth_mb_per_min < 50.0);
    }
}
