//! Bounded TTL + LRU cache used for both the policy cache and the
//! decision cache.
//!
//! Grows to a configured maximum; inserting past capacity evicts exactly one
//! least-recently-accessed entry. Entries also carry a per-insert TTL, so a
//! stale value is dropped on the read that discovers it. Lookups stay on the
//! read lock: recency and the hit/miss counters are atomics, so concurrent
//! readers never serialize behind each other.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    /// Milliseconds since the cache was created; coarse recency for LRU.
    last_accessed: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counters for the observability endpoints.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub inserts: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    inserts: AtomicU64,
}

/// Thread-safe bounded cache. Values are cloned out on hit, so `V` is
/// expected to be cheap to clone (or wrapped in `Arc`).
pub struct TtlLruCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    stats: StatCounters,
    started_at: Instant,
    max_entries: usize,
    default_ttl: Duration,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: StatCounters::default(),
            started_at: Instant::now(),
            max_entries: max_entries.max(1),
            default_ttl,
        }
    }

    fn recency(&self, now: Instant) -> u64 {
        now.duration_since(self.started_at).as_millis() as u64
    }

    /// Look up a key, refreshing its recency on hit. Hits complete entirely
    /// under the read lock; only removing a stale entry upgrades to a write.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if !entry.is_expired(now) => {
                    entry
                        .last_accessed
                        .store(self.recency(now), Ordering::Relaxed);
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
            }
        }

        // Stale entry: re-check under the write lock, a writer may have
        // replaced it in the meantime.
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .map_or(false, |e| e.is_expired(Instant::now()))
        {
            entries.remove(key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert with the cache's default TTL.
    pub async fn put(&self, key: K, value: V) {
        self.put_with_ttl(key, value, self.default_ttl).await;
    }

    /// Insert with an explicit TTL, evicting one LRU entry if at capacity.
    pub async fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let lru = entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(lru_key) = lru {
                entries.remove(&lru_key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + ttl,
                last_accessed: AtomicU64::new(self.recency(now)),
            },
        );
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn invalidate(&self, key: &K) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(key).is_some()
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await.len();
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            entries,
        }
    }

    /// Age of an entry, for diagnostics. `None` when absent.
    pub async fn entry_age(&self, key: &K) -> Option<Duration> {
        let entries = self.entries.read().await;
        entries.get(key).map(|e| e.created_at.elapsed())
    }
}
