//! # In-Memory Cache Store
//!
//! Process-wide in-memory store with a tag index, capacity-bounded eviction of the oldest
//! entries, and an optional background sweep of expired entries.

use super::{CacheEntry, CacheStore, CacheStoreStats, TagMarkOutcome};
use crate::caching::clock::{Clock, SystemClock};
use crate::caching::key::CacheKey;
use crate::core::error::CacheResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

/// In-memory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryCacheConfig {
    /// Maximum number of entries
    pub max_entries: usize,

    /// Cleanup interval for expired entries
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Entries {
    by_key: HashMap<CacheKey, CacheEntry>,
    by_tag: HashMap<String, HashSet<CacheKey>>,
}

impl Entries {
    fn insert(&mut self, entry: CacheEntry) {
        let key = entry.key.clone();
        self.remove(&key);
        for tag in &entry.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.by_key.insert(key, entry);
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.by_key.remove(key)?;
        for tag in &entry.tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        Some(entry)
    }

    fn keys_with_tag(&self, tag: &str) -> Vec<CacheKey> {
        self.by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn oldest_key(&self) -> Option<CacheKey> {
        self.by_key
            .values()
            .min_by_key(|entry| entry.computed_at)
            .map(|entry| entry.key.clone())
    }
}

/// In-memory cache implementation
pub struct InMemoryCache {
    config: InMemoryCacheConfig,
    clock: Arc<dyn Clock>,
    entries: RwLock<Entries>,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_cleanups: AtomicU64,
}

impl InMemoryCache {
    /// Create a new in-memory cache on the wall clock
    pub fn new(config: InMemoryCacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a new in-memory cache with an injected clock
    pub fn with_clock(config: InMemoryCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: RwLock::new(Entries::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_cleanups: AtomicU64::new(0),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Start a task that periodically drops expired entries.
    ///
    /// The task holds only a weak reference and stops once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Cache store dropped, stopping expiry sweeper");
                    break;
                };
                store.sweep_expired();
            }
        })
    }

    fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let expired: Vec<CacheKey> = entries
            .by_key
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key.clone())
            .collect();

        for key in &expired {
            entries.remove(key);
        }

        let count = expired.len();
        if count > 0 {
            self.expired_cleanups.fetch_add(count as u64, Ordering::Relaxed);
            debug!("Cleaned up {} expired cache entries", count);
        }
        count
    }

    fn make_room(&self, entries: &mut Entries, incoming: &CacheKey) {
        if self.config.max_entries == 0 {
            return;
        }

        while entries.by_key.len() >= self.config.max_entries
            && !entries.by_key.contains_key(incoming)
        {
            let Some(oldest) = entries.oldest_key() else {
                break;
            };
            entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %oldest, "Evicted oldest cache entry to make room");
        }
    }

    fn remove_keys(&self, entries: &mut Entries, keys: &[CacheKey]) -> usize {
        let removed = keys
            .iter()
            .filter(|key| entries.remove(key).is_some())
            .count();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let now = self.clock.now();

        {
            let entries = self.entries.read();
            match entries.by_key.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry.clone()));
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
            }
        }

        // Expired: drop it so the caller recomputes.
        let mut entries = self.entries.write();
        if entries
            .by_key
            .get(key)
            .is_some_and(|entry| entry.is_expired(now))
        {
            entries.remove(key);
            self.expired_cleanups.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn set(&self, entry: CacheEntry) -> CacheResult<()> {
        let mut entries = self.entries.write();
        self.make_room(&mut entries, &entry.key);
        entries.insert(entry);
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> CacheResult<bool> {
        let mut entries = self.entries.write();
        Ok(self.remove_keys(&mut entries, std::slice::from_ref(key)) == 1)
    }

    async fn evict_by_tag(&self, tag: &str) -> CacheResult<usize> {
        let mut entries = self.entries.write();
        let keys = entries.keys_with_tag(tag);
        Ok(self.remove_keys(&mut entries, &keys))
    }

    async fn evict_by_path(&self, prefix: &str) -> CacheResult<usize> {
        let mut entries = self.entries.write();
        let keys: Vec<CacheKey> = entries
            .by_key
            .keys()
            .filter(|key| key.has_path_prefix(prefix))
            .cloned()
            .collect();
        Ok(self.remove_keys(&mut entries, &keys))
    }

    async fn mark_stale_by_tag(&self, tag: &str) -> CacheResult<TagMarkOutcome> {
        let mut entries = self.entries.write();
        let keys = entries.keys_with_tag(tag);

        let mut outcome = TagMarkOutcome::default();
        let mut to_evict = Vec::new();
        for key in keys {
            if let Some(entry) = entries.by_key.get_mut(&key) {
                if entry.lifetime.is_mutation() {
                    to_evict.push(key);
                } else {
                    entry.marked_stale = true;
                    outcome.marked += 1;
                }
            }
        }
        outcome.evicted = self.remove_keys(&mut entries, &to_evict);
        Ok(outcome)
    }

    async fn evict_expired(&self) -> CacheResult<usize> {
        Ok(self.sweep_expired())
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut entries = self.entries.write();
        let entry_count = entries.by_key.len();
        *entries = Entries::default();

        info!("Cleared {} entries from in-memory cache", entry_count);
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        let entries = self.entries.read();
        Ok(CacheStoreStats {
            entries: entries.by_key.len(),
            tags: entries.by_tag.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_cleanups: self.expired_cleanups.load(Ordering::Relaxed),
        })
    }
}
