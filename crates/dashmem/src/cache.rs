// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! LRU + TTL cache with byte caps, plus the tiered (L1/L2) variant.
//!
//! The recency order rides on the `lru` crate's linked hash map, giving O(1)
//! get/set/delete; TTL, byte accounting, statistics, and pattern
//! invalidation are layered on top. A periodic sweep drops expired entries;
//! it runs opportunistically on writes and can also be driven by
//! [`spawn_sweeper`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::{EventBus, MemoryEvent};
use crate::types::now_ms;

/// Types that can report an approximate in-memory footprint.
pub trait ByteEstimate {
    /// Approximate size in bytes.
    fn byte_estimate(&self) -> usize;
}

impl ByteEstimate for String {
    fn byte_estimate(&self) -> usize {
        self.len()
    }
}

impl<T: ByteEstimate> ByteEstimate for Vec<T> {
    fn byte_estimate(&self) -> usize {
        self.iter().map(ByteEstimate::byte_estimate).sum()
    }
}

impl ByteEstimate for crate::types::MemoryEntry {
    fn byte_estimate(&self) -> usize {
        crate::types::MemoryEntry::byte_estimate(self)
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entry count.
    pub max_size: usize,
    /// Optional byte cap across all cached values.
    pub max_memory_bytes: Option<usize>,
    /// Default TTL in ms; `None` means entries never expire.
    pub ttl_ms: Option<u64>,
    /// Sweep cadence in ms.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_memory_bytes: None,
            ttl_ms: Some(300_000),
            sweep_interval_ms: 60_000,
        }
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total cache hits.
    pub hits: u64,
    /// Total cache misses.
    pub misses: u64,
    /// Entries evicted under size/byte pressure.
    pub evictions: u64,
    /// Entries dropped because their TTL passed.
    pub expirations: u64,
    /// Entries currently cached.
    pub entries: u64,
    /// Approximate bytes currently cached.
    pub bytes: u64,
}

impl CacheStats {
    /// Hit rate in [0, 1]; 0 when no lookups have happened.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheSlot<V> {
    value: V,
    cached_at: i64,
    expires_at: Option<i64>,
    last_accessed_at: i64,
    access_count: u64,
    byte_estimate: usize,
}

impl<V> CacheSlot<V> {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct CacheInner<V> {
    map: LruCache<String, CacheSlot<V>>,
    bytes: usize,
    stats: CacheStats,
    last_sweep: i64,
}

/// LRU + TTL cache.
pub struct LruTtlCache<V> {
    config: CacheConfig,
    inner: Mutex<CacheInner<V>>,
    events: Option<EventBus>,
}

impl<V: Clone + ByteEstimate> LruTtlCache<V> {
    /// Create a cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                map: LruCache::unbounded(),
                bytes: 0,
                stats: CacheStats::default(),
                last_sweep: now_ms(),
            }),
            events: None,
        }
    }

    /// Create with default configuration.
    #[must_use]
    pub fn default_config() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Attach an event bus for hit/miss/eviction telemetry.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: MemoryEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Get a value, promoting it to most-recently-used. Expired entries are
    /// removed and report a miss.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let now = now_ms();
        let mut inner = self.inner.lock();
        let expired = inner.map.peek(key).is_some_and(|slot| slot.is_expired(now));
        if expired {
            if let Some(slot) = inner.map.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(slot.byte_estimate);
            }
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            drop(inner);
            self.emit(MemoryEvent::CacheExpired {
                key: key.to_string(),
            });
            self.emit(MemoryEvent::CacheMiss {
                key: key.to_string(),
            });
            return None;
        }
        match inner.map.get_mut(key) {
            Some(slot) => {
                slot.last_accessed_at = now;
                slot.access_count += 1;
                let value = slot.value.clone();
                inner.stats.hits += 1;
                drop(inner);
                self.emit(MemoryEvent::CacheHit {
                    key: key.to_string(),
                });
                Some(value)
            }
            None => {
                inner.stats.misses += 1;
                drop(inner);
                self.emit(MemoryEvent::CacheMiss {
                    key: key.to_string(),
                });
                None
            }
        }
    }

    /// Set a value under the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.config.ttl_ms);
    }

    /// Set a value with an explicit TTL (`None` = never expires).
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl_ms: Option<u64>) {
        let key = key.into();
        let now = now_ms();
        let new_bytes = value.byte_estimate();
        let slot = CacheSlot {
            value,
            cached_at: now,
            expires_at: ttl_ms.map(|ttl| now + ttl as i64),
            last_accessed_at: now,
            access_count: 0,
            byte_estimate: new_bytes,
        };

        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            if now - inner.last_sweep >= self.config.sweep_interval_ms as i64 {
                Self::sweep_locked(&mut inner, now);
            }
            // Replacing an existing key frees its bytes first.
            if let Some(old) = inner.map.pop(&key) {
                inner.bytes = inner.bytes.saturating_sub(old.byte_estimate);
            }
            // Evict from the LRU end until both caps hold.
            while inner.map.len() >= self.config.max_size
                || self
                    .config
                    .max_memory_bytes
                    .is_some_and(|cap| inner.bytes + new_bytes > cap)
            {
                match inner.map.pop_lru() {
                    Some((evicted_key, old)) => {
                        inner.bytes = inner.bytes.saturating_sub(old.byte_estimate);
                        inner.stats.evictions += 1;
                        evicted.push(evicted_key);
                    }
                    None => break,
                }
            }
            inner.bytes += new_bytes;
            inner.map.put(key, slot);
        }
        for key in evicted {
            self.emit(MemoryEvent::CacheEviction { key });
        }
    }

    /// Delete a key. Returns `true` when it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.pop(key) {
            Some(slot) => {
                inner.bytes = inner.bytes.saturating_sub(slot.byte_estimate);
                true
            }
            None => false,
        }
    }

    /// Remove everything.
    pub fn clear(&self) {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.map.len();
            inner.map.clear();
            inner.bytes = 0;
            removed
        };
        self.emit(MemoryEvent::CacheCleared { entries: removed });
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// True when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every key matching `pattern`. Returns the number removed.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        let mut inner = self.inner.lock();
        let matching: Vec<String> = inner
            .map
            .iter()
            .filter(|(k, _)| pattern.is_match(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &matching {
            if let Some(slot) = inner.map.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(slot.byte_estimate);
            }
        }
        matching.len()
    }

    /// Drop expired entries now. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        Self::sweep_locked(&mut inner, now_ms())
    }

    fn sweep_locked(inner: &mut CacheInner<V>, now: i64) -> usize {
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, slot)| slot.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(slot) = inner.map.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(slot.byte_estimate);
            }
        }
        inner.stats.expirations += expired.len() as u64;
        inner.last_sweep = now;
        expired.len()
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.entries = inner.map.len() as u64;
        stats.bytes = inner.bytes as u64;
        stats
    }

    /// Age of a cached entry in ms, if present (does not promote).
    #[must_use]
    pub fn age_ms(&self, key: &str) -> Option<i64> {
        let inner = self.inner.lock();
        inner.map.peek(key).map(|slot| now_ms() - slot.cached_at)
    }

    /// Per-entry access bookkeeping `(last_accessed_at, access_count)`, if
    /// present (does not promote).
    #[must_use]
    pub fn access_info(&self, key: &str) -> Option<(i64, u64)> {
        let inner = self.inner.lock();
        inner
            .map
            .peek(key)
            .map(|slot| (slot.last_accessed_at, slot.access_count))
    }
}

/// Spawn a background task that sweeps `cache` on its configured interval.
pub fn spawn_sweeper<V>(cache: Arc<LruTtlCache<V>>) -> tokio::task::JoinHandle<()>
where
    V: Clone + ByteEstimate + Send + Sync + 'static,
{
    let interval = Duration::from_millis(cache.config.sweep_interval_ms.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let removed = cache.sweep();
            if removed > 0 {
                tracing::debug!(removed, "cache sweep dropped expired entries");
            }
        }
    })
}

/// A second cache tier: a caller-supplied loader and (optional) writer.
#[async_trait]
pub trait SecondTier<V>: Send + Sync {
    /// Load a value from the tier.
    async fn load(&self, key: &str) -> Result<Option<V>>;

    /// Write a value through to the tier. Default is a no-op; implement it
    /// to opt in to write-through.
    async fn write(&self, _key: &str, _value: &V) -> Result<()> {
        Ok(())
    }

    /// Remove a value from the tier. Default is a no-op.
    async fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// Tiered cache: an in-process L1 in front of a delegated L2.
///
/// L1 misses consult L2 and backfill; writes land in L1 and, when
/// write-through is enabled, in L2 as well.
pub struct TieredCache<V> {
    l1: LruTtlCache<V>,
    l2: Option<Arc<dyn SecondTier<V>>>,
    write_through: bool,
}

impl<V: Clone + ByteEstimate> TieredCache<V> {
    /// L1-only tiered cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            l1: LruTtlCache::new(config),
            l2: None,
            write_through: false,
        }
    }

    /// Attach an L2 tier. `write_through` controls whether writes propagate.
    #[must_use]
    pub fn with_second_tier(mut self, l2: Arc<dyn SecondTier<V>>, write_through: bool) -> Self {
        self.l2 = Some(l2);
        self.write_through = write_through;
        self
    }

    /// Get, consulting L2 on an L1 miss and backfilling L1 on an L2 hit.
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        if let Some(value) = self.l1.get(key) {
            return Ok(Some(value));
        }
        if let Some(l2) = &self.l2 {
            if let Some(value) = l2.load(key).await? {
                self.l1.set(key, value.clone());
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Set in L1 and, when configured, write through to L2.
    pub async fn set(&self, key: &str, value: V) -> Result<()> {
        if self.write_through {
            if let Some(l2) = &self.l2 {
                l2.write(key, &value).await?;
            }
        }
        self.l1.set(key, value);
        Ok(())
    }

    /// Delete from both tiers. Returns whether L1 held the key.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        if let Some(l2) = &self.l2 {
            l2.remove(key).await?;
        }
        Ok(self.l1.delete(key))
    }

    /// L1 statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.l1.stats()
    }
}
