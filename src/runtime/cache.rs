/// Result cache with pluggable eviction and transparent compression
///
/// Values are stored as serialized JSON, gzip-compressed when larger than the
/// configured threshold and only if compression actually helps. Resident
/// entry count and byte size never exceed the configured ceilings: eviction
/// runs inside `set` before the insert. Expired entries are dropped lazily on
/// read and by a background sweep for keys nobody reads.

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{CacheConfig, EvictionPolicy};
use crate::error::{Result, RuntimeError};
use crate::runtime::events::{EventBus, RuntimeEvent};
use crate::runtime::memory::Reclaim;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Arc<Vec<u8>>,
    /// Stored (possibly compressed) size in bytes
    size: usize,
    /// Serialized size before compression
    raw_size: usize,
    hits: u64,
    created_at: Instant,
    last_accessed_at: Instant,
    expires_at: Instant,
    compressed: bool,
    /// Monotonic tie-breakers for entries sharing an instant
    created_seq: u64,
    accessed_seq: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
    seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size;
        Some(entry)
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<String> {
        let entries = self.entries.iter();
        let found = match policy {
            EvictionPolicy::Lru => entries.min_by_key(|(_, e)| (e.last_accessed_at, e.accessed_seq)),
            EvictionPolicy::Lfu => entries.min_by_key(|(_, e)| (e.hits, e.last_accessed_at, e.accessed_seq)),
            EvictionPolicy::Fifo => entries.min_by_key(|(_, e)| (e.created_at, e.created_seq)),
        };
        found.map(|(key, _)| key.clone())
    }

    /// Evict until `entries <= max_entries` and `bytes <= max_bytes`
    fn evict_until(&mut self, policy: EvictionPolicy, max_entries: usize, max_bytes: usize) -> (usize, usize) {
        let (mut count, mut bytes) = (0, 0);
        while self.entries.len() > max_entries || self.total_bytes > max_bytes {
            let Some(key) = self.victim(policy) else { break };
            if let Some(entry) = self.remove(&key) {
                count += 1;
                bytes += entry.size;
            }
        }
        self.evictions += count as u64;
        (count, bytes)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheMetrics {
    pub entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub evictions: u64,
    /// Bytes saved by compression relative to bytes stored
    pub compression_ratio: f64,
}

/// Bounded, TTL-aware result cache
#[derive(Debug)]
pub struct ResultCache {
    config: CacheConfig,
    max_bytes: usize,
    state: Mutex<CacheState>,
    events: EventBus,
}

impl ResultCache {
    pub fn new(config: CacheConfig, events: EventBus) -> Self {
        Self {
            max_bytes: config.max_size_bytes(),
            config,
            state: Mutex::new(CacheState::default()),
            events,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fetch and decode a live entry; expired entries are removed on the spot
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let (bytes, compressed) = {
            let mut state = self.state.lock();
            let Some(expired) = state.entries.get(key).map(|e| e.expires_at <= now) else {
                state.misses += 1;
                return None;
            };

            if expired {
                state.remove(key);
                state.misses += 1;
                drop(state);
                self.events.emit(RuntimeEvent::EntryRemoved { key: key.to_string() });
                return None;
            }

            let seq = state.next_seq();
            state.hits += 1;
            let entry = state.entries.get_mut(key)?;
            entry.hits += 1;
            entry.last_accessed_at = now;
            entry.accessed_seq = seq;
            (entry.value.clone(), entry.compressed)
        };

        match decode(&bytes, compressed) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("⚠️ Dropping undecodable cache entry '{}': {}", key, e);
                self.delete(key);
                None
            }
        }
    }

    /// Store a value with the default TTL
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with_ttl(key, value, None)
    }

    /// Store a value, evicting first if the insert would break a ceiling
    pub fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        let raw_size = raw.len();

        let (stored, compressed) = if self.config.compression_enabled
            && raw_size > self.config.compression_threshold
        {
            let packed = compress(&raw)?;
            if packed.len() < raw_size {
                (packed, true)
            } else {
                (raw, false)
            }
        } else {
            (raw, false)
        };

        let size = stored.len();
        if size > self.max_bytes {
            return Err(RuntimeError::Cache(format!(
                "entry '{}' of {} bytes exceeds cache capacity of {} bytes",
                key, size, self.max_bytes
            )));
        }

        let ttl = ttl.unwrap_or(Duration::from_millis(self.config.ttl_ms));
        let now = Instant::now();

        let (replaced, (evicted, evicted_bytes)) = {
            let mut state = self.state.lock();
            let replaced = state.remove(key).is_some();

            let evicted = state.evict_until(
                self.config.eviction_policy,
                self.config.max_entries.saturating_sub(1),
                self.max_bytes - size,
            );

            let seq = state.next_seq();
            state.total_bytes += size;
            state.entries.insert(
                key.to_string(),
                CacheEntry {
                    value: Arc::new(stored),
                    size,
                    raw_size,
                    hits: 0,
                    created_at: now,
                    last_accessed_at: now,
                    expires_at: now + ttl,
                    compressed,
                    created_seq: seq,
                    accessed_seq: seq,
                },
            );
            (replaced, evicted)
        };

        if replaced {
            self.events.emit(RuntimeEvent::EntryRemoved { key: key.to_string() });
        }
        if evicted > 0 {
            tracing::debug!("🗑️ Evicted {} cache entries ({} bytes)", evicted, evicted_bytes);
            self.events.emit(RuntimeEvent::EntriesEvicted {
                count: evicted,
                bytes: evicted_bytes,
            });
        }
        self.events.emit(RuntimeEvent::EntryAdded {
            key: key.to_string(),
            size,
            compressed,
        });
        Ok(())
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.state.lock().remove(key).is_some();
        if removed {
            self.events.emit(RuntimeEvent::EntryRemoved { key: key.to_string() });
        }
        removed
    }

    /// Whether a live entry exists, without touching hit statistics
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .map(|e| e.expires_at > now)
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Remove every entry past its expiry; returns the number removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let removed: Vec<String> = {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                state.remove(key);
            }
            expired
        };

        for key in &removed {
            self.events.emit(RuntimeEvent::EntryRemoved { key: key.clone() });
        }
        removed.len()
    }

    pub fn metrics(&self) -> CacheMetrics {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        let saved: usize = state
            .entries
            .values()
            .filter(|e| e.compressed)
            .map(|e| e.raw_size - e.size)
            .sum();

        CacheMetrics {
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            hits: state.hits,
            misses: state.misses,
            hit_rate: ratio(state.hits, lookups),
            miss_rate: ratio(state.misses, lookups),
            evictions: state.evictions,
            compression_ratio: if state.total_bytes == 0 {
                0.0
            } else {
                saved as f64 / state.total_bytes as f64
            },
        }
    }

    /// Sweep expired entries on the configured interval until cancelled or dropped
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.sweep_interval_ms);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            tracing::debug!("🧽 Cache sweep removed {} expired entries", purged);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

impl Reclaim for ResultCache {
    fn name(&self) -> &str {
        "result_cache"
    }

    /// Drop expired entries, then evict down to half of both ceilings
    fn reclaim(&self) -> usize {
        let expired = self.purge_expired();
        let (evicted, bytes) = self.state.lock().evict_until(
            self.config.eviction_policy,
            self.config.max_entries / 2,
            self.max_bytes / 2,
        );
        if evicted > 0 {
            self.events.emit(RuntimeEvent::EntriesEvicted { count: evicted, bytes });
        }
        expired + evicted
    }
}

fn compress(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8], compressed: bool) -> Result<T> {
    if compressed {
        let mut raw = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut raw)?;
        Ok(serde_json::from_slice(&raw)?)
    } else {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
