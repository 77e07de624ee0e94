//! In-memory price cache keyed by (asset, quote currency).
//!
//! Entries are never dropped for being old: staleness is computed at read
//! time so a stale value stays available as a degraded fallback. An optional
//! size cap evicts the least recently used pair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::{PairKey, PricePoint};

#[derive(Debug, Clone)]
struct CacheEntry {
    price: PricePoint,
    stored_at: Instant,
    last_access: u64,
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    pub price: PricePoint,
    /// Time since the value was fetched from a provider.
    pub age: Duration,
    /// `age <= ttl` at the moment of the read.
    pub is_fresh: bool,
}

/// Thread-safe price cache.
///
/// Reads and writes on one key are serialized by its map shard; distinct
/// keys never wait on a cache-wide lock. Writes are last-write-wins.
#[derive(Debug, Clone)]
pub struct PriceCache {
    map: Arc<DashMap<PairKey, CacheEntry>>,
    ttl: Duration,
    max_entries: Option<usize>,
    clock: Arc<AtomicU64>,
}

impl PriceCache {
    /// Create a cache with the given freshness TTL and no size cap.
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: Arc::new(DashMap::new()),
            ttl,
            max_entries: None,
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a cache with the default one hour TTL.
    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(3_600))
    }

    /// Bound the number of pairs held; the least recently used pair is evicted.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up `key`, reporting freshness against the cache TTL.
    pub fn get(&self, key: &PairKey) -> Option<CacheLookup> {
        let tick = self.tick();
        let mut entry = self.map.get_mut(key)?;
        entry.last_access = tick;
        let age = entry.stored_at.elapsed();
        Some(CacheLookup {
            price: entry.price.clone(),
            age,
            is_fresh: age <= self.ttl,
        })
    }

    /// Store a freshly resolved price, replacing any previous entry whole.
    pub fn put(&self, price: PricePoint) {
        let key = price.pair.clone();
        let entry = CacheEntry {
            price,
            stored_at: Instant::now(),
            last_access: self.tick(),
        };
        self.map.insert(key, entry);

        if let Some(max_entries) = self.max_entries {
            while self.map.len() > max_entries {
                if !self.evict_least_recent() {
                    break;
                }
            }
        }
    }

    pub fn invalidate(&self, key: &PairKey) -> bool {
        self.map.remove(key).is_some()
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    ///
    /// Not called by the resolver: stale entries are its last-resort output.
    pub fn purge_stale(&self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.stored_at.elapsed() <= self.ttl);
        before.saturating_sub(self.map.len())
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_least_recent(&self) -> bool {
        let victim = self
            .map
            .iter()
            .min_by_key(|entry| entry.value().last_access)
            .map(|entry| entry.key().clone());

        match victim {
            Some(key) => {
                self.map.remove(&key);
                tracing::debug!(pair = %key, "cache.evict");
                true
            }
            None => false,
        }
    }
}
