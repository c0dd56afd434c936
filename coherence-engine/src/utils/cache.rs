//! Bounded in-memory cache with TTL and capacity eviction
//!
//! - Every entry carries an expiry; expired entries are never returned
//! - A background sweeper removes expired entries on a fixed interval,
//!   independent of capacity eviction
//! - When the entry count exceeds `max_entries`, entries are evicted by the
//!   configured policy:
//!   - `Lru`: least-recently-accessed first, O(1) amortized (map plus a
//!     recency queue with lazy invalidation)
//!   - `OldestAccess`: linear scan for the oldest `last_access`

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cache errors
#[derive(Debug, Error, PartialEq)]
pub enum CacheError {
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),
}

/// Capacity eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    OldestAccess,
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default)]
    pub policy: EvictionPolicy,
}

fn default_max_entries() -> usize {
    10_000
}
fn default_ttl_ms() -> u64 {
    300_000
}
fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            default_ttl_ms: default_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            policy: EvictionPolicy::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("cache.max_entries must be at least 1".to_string());
        }
        if self.default_ttl_ms == 0 {
            return Err("cache.default_ttl_ms must be positive".to_string());
        }
        if self.sweep_interval_ms == 0 {
            return Err("cache.sweep_interval_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// Counters exposed for health output
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry<V> {
    data: V,
    expiry: Instant,
    hit_count: u64,
    last_access: Instant,
    /// Tick of the latest access; matches exactly one live recency-queue slot
    recency: u64,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    recency: VecDeque<(String, u64)>,
    tick: u64,
    stats: CacheStats,
}

impl<V> CacheInner<V> {
    fn touch(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.recency = tick;
            self.recency.push_back((key.to_string(), tick));
        }
        if self.recency.len() > 2 * self.entries.len() + 32 {
            self.compact();
        }
    }

    /// Drop stale recency slots
    fn compact(&mut self) {
        let entries = &self.entries;
        self.recency
            .retain(|(k, t)| entries.get(k).map(|e| e.recency == *t).unwrap_or(false));
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        // queue slot goes stale and is skipped lazily
        self.entries.remove(key)
    }

    fn evict_lru(&mut self) -> Option<String> {
        while let Some((key, tick)) = self.recency.pop_front() {
            let live = self
                .entries
                .get(&key)
                .map(|e| e.recency == tick)
                .unwrap_or(false);
            if live {
                self.entries.remove(&key);
                return Some(key);
            }
        }
        None
    }

    fn evict_oldest_access(&mut self) -> Option<String> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.last_access, e.recency))
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Bounded TTL cache keyed by string
pub struct CacheManager<V> {
    config: CacheConfig,
    inner: Mutex<CacheInner<V>>,
    cancel: CancellationToken,
}

impl<V: Clone + Send + 'static> CacheManager<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                tick: 0,
                stats: CacheStats::default(),
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn validate_key(key: &str) -> Result<(), CacheError> {
        if key.is_empty() {
            Err(CacheError::InvalidKey("key is empty".to_string()))
        } else {
            Ok(())
        }
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> Result<Duration, CacheError> {
        match ttl {
            Some(ttl) if ttl.is_zero() => {
                Err(CacheError::InvalidTtl("ttl must be positive".to_string()))
            }
            Some(ttl) => Ok(ttl),
            None => Ok(Duration::from_millis(self.config.default_ttl_ms)),
        }
    }

    /// Fetch a live entry, counting a hit and refreshing its recency
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = inner.entries.get(key).map(|entry| now >= entry.expiry);
        let Some(expired) = expired else {
            inner.stats.misses += 1;
            return None;
        };

        if expired {
            inner.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }

        inner.stats.hits += 1;
        let value = inner.entries.get_mut(key).map(|entry| {
            entry.hit_count += 1;
            entry.last_access = now;
            entry.data.clone()
        });
        inner.touch(key);
        value
    }

    /// Insert or replace an entry; `ttl = None` uses the configured default
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        Self::validate_key(key)?;
        let ttl = self.resolve_ttl(ttl)?;
        let now = Instant::now();

        let mut inner = self.lock();
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                data: value,
                expiry: now + ttl,
                hit_count: 0,
                last_access: now,
                recency: 0,
            },
        );
        inner.touch(key);

        while inner.entries.len() > self.config.max_entries {
            let evicted = match self.config.policy {
                EvictionPolicy::Lru => inner.evict_lru(),
                EvictionPolicy::OldestAccess => inner.evict_oldest_access(),
            };
            match evicted {
                Some(evicted) => {
                    inner.stats.evictions += 1;
                    tracing::trace!(key = %evicted, "Cache entry evicted");
                }
                None => break,
            }
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Whether a live entry exists (does not count as an access)
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .map(|e| now < e.expiry)
            .unwrap_or(false)
    }

    /// Batched `get`, results in key order
    pub fn mget(&self, keys: &[&str]) -> Vec<Option<V>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Batched `set`; validates every key first so the batch is all-or-nothing
    pub fn mset(&self, items: Vec<(String, V)>, ttl: Option<Duration>) -> Result<(), CacheError> {
        for (key, _) in &items {
            Self::validate_key(key)?;
        }
        self.resolve_ttl(ttl)?;
        for (key, value) in items {
            self.set(&key, value, ttl)?;
        }
        Ok(())
    }

    /// Times an entry has been read
    pub fn hit_count(&self, key: &str) -> Option<u64> {
        self.lock().entries.get(key).map(|e| e.hit_count)
    }

    /// Remove every expired entry; returns the number removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| now < e.expiry);
        let removed = before - inner.entries.len();
        inner.stats.expirations += removed as u64;
        if removed > 0 {
            inner.compact();
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }

    /// Spawn the periodic expiry sweep; stopped by `destroy()`
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = Duration::from_millis(self.config.sweep_interval_ms);

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // first tick completes immediately
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "Cache sweep removed expired entries");
                        }
                    }
                }
            }
        })
    }

    /// Stop the sweeper and drop all entries; safe to call repeatedly
    pub fn destroy(&self) {
        self.cancel.cancel();
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, policy: EvictionPolicy) -> CacheManager<String> {
        CacheManager::new(CacheConfig {
            max_entries,
            default_ttl_ms: 1_000,
            sweep_interval_ms: 100,
            policy,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_and_expiry() {
        let cache = cache(10, EvictionPolicy::Lru);
        cache
            .set("k", "v".to_string(), Some(Duration::from_millis(500)))
            .unwrap();
        assert_eq!(cache.get("k"), Some("v".to_string()));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_evicts_least_recently_accessed() {
        let cache = cache(3, EvictionPolicy::Lru);
        cache.set("a", "1".into(), None).unwrap();
        cache.set("b", "2".into(), None).unwrap();
        cache.set("c", "3".into(), None).unwrap();

        // touch a so b becomes least recently accessed
        assert!(cache.get("a").is_some());
        cache.set("d", "4".into(), None).unwrap();

        assert!(cache.has("a"));
        assert!(!cache.has("b"));
        assert!(cache.has("c"));
        assert!(cache.has("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oldest_access_policy() {
        let cache = cache(2, EvictionPolicy::OldestAccess);
        cache.set("a", "1".into(), None).unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("b", "2".into(), None).unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(cache.get("a").is_some());
        cache.set("c", "3".into(), None).unwrap();

        assert!(cache.has("a"));
        assert!(!cache.has("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recency_queue_stays_bounded() {
        let cache = cache(4, EvictionPolicy::Lru);
        cache.set("a", "1".into(), None).unwrap();
        for _ in 0..1_000 {
            cache.get("a");
        }
        assert!(cache.lock().recency.len() <= 2 * 1 + 33);
        assert_eq!(cache.hit_count("a"), Some(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mget_mset() {
        let cache = cache(10, EvictionPolicy::Lru);
        cache
            .mset(
                vec![("a".into(), "1".into()), ("b".into(), "2".into())],
                None,
            )
            .unwrap();
        assert_eq!(
            cache.mget(&["a", "missing", "b"]),
            vec![Some("1".to_string()), None, Some("2".to_string())]
        );

        let bad = cache.mset(vec![("c".into(), "3".into()), ("".into(), "4".into())], None);
        assert!(bad.is_err());
        assert!(!cache.has("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_zero_ttl_and_empty_key() {
        let cache = cache(10, EvictionPolicy::Lru);
        assert!(matches!(
            cache.set("k", "v".into(), Some(Duration::ZERO)),
            Err(CacheError::InvalidTtl(_))
        ));
        assert!(matches!(
            cache.set("", "v".into(), None),
            Err(CacheError::InvalidKey(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let cache = Arc::new(cache(10, EvictionPolicy::Lru));
        cache
            .set("short", "v".into(), Some(Duration::from_millis(50)))
            .unwrap();
        cache.set("long", "v".into(), None).unwrap();
        let handle = cache.start_sweeper();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.has("long"));

        cache.destroy();
        handle.await.unwrap();
        assert!(cache.is_empty());
    }
}
