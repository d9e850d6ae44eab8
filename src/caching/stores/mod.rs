//! # Cache Stores Module
//!
//! The store owns every cache entry. Queries and the invalidation dispatcher only ever hold
//! keys and tags, never references into the store, and reach entries through [`CacheStore`].

pub mod memory;

pub use memory::{InMemoryCache, InMemoryCacheConfig};

use crate::caching::clock::age_between;
use crate::caching::key::CacheKey;
use crate::caching::profiles::CacheProfile;
use crate::core::error::CacheResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How long an entry may be served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifetime {
    /// Governed by a resolved profile
    Timed(CacheProfile),

    /// Cached until explicitly invalidated
    Indefinite,
}

impl Lifetime {
    /// Zero-expiry lifetimes are never served from cache
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Timed(profile) if profile.is_mutation())
    }
}

/// Where an entry sits in its lifetime at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Serve without any refresh
    Fresh,
    /// Serve, and refresh in the background
    Stale,
    /// Do not serve; recompute synchronously
    Expired,
}

/// Cache entry with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,

    /// The cached value in its stored form
    pub value: serde_json::Value,

    pub tags: BTreeSet<String>,

    pub computed_at: DateTime<Utc>,

    pub lifetime: Lifetime,

    /// Set by a soft tag invalidation; forces the next read into the stale path
    #[serde(default)]
    pub marked_stale: bool,
}

impl CacheEntry {
    pub fn new(
        key: CacheKey,
        value: serde_json::Value,
        tags: BTreeSet<String>,
        computed_at: DateTime<Utc>,
        lifetime: Lifetime,
    ) -> Self {
        Self {
            key,
            value,
            tags,
            computed_at,
            lifetime,
            marked_stale: false,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Instant after which the entry must not be served
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self.lifetime {
            Lifetime::Timed(profile) => {
                let expire = ChronoDuration::from_std(profile.expire_after())
                    .unwrap_or_else(|_| ChronoDuration::max_value());
                self.computed_at.checked_add_signed(expire)
            }
            Lifetime::Indefinite => None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.freshness(now) == Freshness::Expired
    }

    /// Classify the entry at `now`.
    ///
    /// Expired once its age reaches `expire`; stale once its age reaches
    /// `max(stale, revalidate)` or after a soft invalidation; fresh otherwise.
    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        let age = age_between(self.computed_at, now);
        match self.lifetime {
            Lifetime::Indefinite if self.marked_stale => Freshness::Stale,
            Lifetime::Indefinite => Freshness::Fresh,
            Lifetime::Timed(profile) => {
                if age >= profile.expire_after() {
                    Freshness::Expired
                } else if self.marked_stale || age >= profile.refresh_after() {
                    Freshness::Stale
                } else {
                    Freshness::Fresh
                }
            }
        }
    }
}

/// Result of a soft tag invalidation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagMarkOutcome {
    /// Entries marked stale and kept
    pub marked: usize,
    /// Zero-expiry entries removed outright
    pub evicted: usize,
}

/// Trait for cache store implementations
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get an entry. Entries past their expire window are never returned.
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>>;

    /// Insert or replace an entry
    async fn set(&self, entry: CacheEntry) -> CacheResult<()>;

    /// Remove a single entry
    async fn evict(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Remove every entry carrying `tag`
    async fn evict_by_tag(&self, tag: &str) -> CacheResult<usize>;

    /// Remove every entry whose key is filed under the path `prefix`
    async fn evict_by_path(&self, prefix: &str) -> CacheResult<usize>;

    /// Mark every entry carrying `tag` stale. Zero-expiry entries are removed instead.
    async fn mark_stale_by_tag(&self, tag: &str) -> CacheResult<TagMarkOutcome>;

    /// Remove entries whose expire window has elapsed
    async fn evict_expired(&self) -> CacheResult<usize>;

    /// Clear all entries from the cache
    async fn clear(&self) -> CacheResult<()>;

    /// Get cache statistics
    async fn stats(&self) -> CacheResult<CacheStoreStats>;
}

/// Cache store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStoreStats {
    /// Number of entries
    pub entries: usize,

    /// Number of distinct tags in use
    pub tags: usize,

    /// Number of hits
    pub hits: u64,

    /// Number of misses
    pub misses: u64,

    /// Number of entries removed by invalidation or capacity pressure
    pub evictions: u64,

    /// Number of expired entries cleaned up
    pub expired_cleanups: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry_at(start: DateTime<Utc>, lifetime: Lifetime) -> CacheEntry {
        CacheEntry::new(
            CacheKey::from("/api/posts"),
            serde_json::json!([1, 2, 3]),
            BTreeSet::new(),
            start,
            lifetime,
        )
    }

    fn after(start: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
        start + ChronoDuration::from_std(Duration::from_secs(secs)).unwrap()
    }

    #[test]
    fn test_seconds_profile_freshness_windows() {
        let start = Utc::now();
        let entry = entry_at(start, Lifetime::Timed(CacheProfile::new(30, 1, 60)));

        assert_eq!(entry.freshness(after(start, 10)), Freshness::Fresh);
        assert_eq!(entry.freshness(after(start, 45)), Freshness::Stale);
        assert_eq!(entry.freshness(after(start, 60)), Freshness::Expired);
        assert_eq!(entry.freshness(after(start, 70)), Freshness::Expired);
    }

    #[test]
    fn test_mutation_lifetime_is_expired_immediately() {
        let start = Utc::now();
        let entry = entry_at(start, Lifetime::Timed(CacheProfile::mutation()));
        assert!(entry.lifetime.is_mutation());
        assert_eq!(entry.freshness(start), Freshness::Expired);
    }

    #[test]
    fn test_indefinite_lifetime_only_goes_stale_when_marked() {
        let start = Utc::now();
        let mut entry = entry_at(start, Lifetime::Indefinite);
        assert_eq!(entry.freshness(after(start, 10 * 365 * 86_400)), Freshness::Fresh);
        assert_eq!(entry.expires_at(), None);

        entry.marked_stale = true;
        assert_eq!(entry.freshness(start), Freshness::Stale);
    }

    #[test]
    fn test_marked_entry_still_expires() {
        let start = Utc::now();
        let mut entry = entry_at(start, Lifetime::Timed(CacheProfile::new(30, 1, 60)));
        entry.marked_stale = true;

        assert_eq!(entry.freshness(after(start, 1)), Freshness::Stale);
        assert_eq!(entry.freshness(after(start, 61)), Freshness::Expired);
    }
}
