//! # Caching System Module
//!
//! Server-side data-fetching cache: named lifetime profiles, tagged cached queries with
//! stale-while-revalidate reads, and invalidation by tag or path.
//!
//! ## Architecture
//! 1. **Profiles**: name → `{stale, revalidate, expire}` lookup
//! 2. **Store**: owns all entries; in-memory implementation with a tag index
//! 3. **Queries**: wrap async producers, deduplicate concurrent recomputes per key
//! 4. **Invalidation**: evict or soft-mark entries by tag, evict by path
//!
//! ## Usage Example
//! ```no_run
//! use std::sync::Arc;
//! use revalidator::caching::{
//!     CacheLayer, CachedQueryOptions, InMemoryCache, InMemoryCacheConfig, ProfileRegistry,
//! };
//!
//! # async fn demo() -> revalidator::CacheResult<()> {
//! let store = Arc::new(InMemoryCache::new(InMemoryCacheConfig::default()));
//! let cache = CacheLayer::new(store, ProfileRegistry::builtin());
//!
//! let posts = cache.queries().create_cached_query(
//!     || async { Ok(vec!["hello".to_string()]) },
//!     CachedQueryOptions::new(["/api/posts"]).tags(["posts"]).profile("hours"),
//! )?;
//! let _titles: Vec<String> = posts.call().await?;
//!
//! cache.invalidation().invalidate_data("posts", false).await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod invalidation;
pub mod key;
pub mod profiles;
pub mod query;
pub mod stores;

pub use clock::{Clock, ManualClock, SystemClock};
pub use invalidation::{
    InvalidateOptions, InvalidationDispatcher, InvalidationEvent, InvalidationMode,
    InvalidationTarget,
};
pub use key::CacheKey;
pub use profiles::{
    CacheProfile, InlineProfile, ProfileRegistry, ProfileSpec, DEFAULT_PROFILE, MUTATION_PROFILE,
};
pub use query::{CachedQuery, CachedQueryFactory, CachedQueryOptions, Revalidate};
pub use stores::{
    CacheEntry, CacheStore, CacheStoreStats, Freshness, InMemoryCache, InMemoryCacheConfig,
    Lifetime, TagMarkOutcome,
};

use std::sync::Arc;

/// Query factory and invalidation dispatcher wired to one store, registry and clock
#[derive(Clone)]
pub struct CacheLayer {
    queries: CachedQueryFactory,
    invalidation: Arc<InvalidationDispatcher>,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>, registry: ProfileRegistry) -> Self {
        Self::with_clock(store, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CacheStore>,
        registry: ProfileRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(registry);
        let queries = CachedQueryFactory::with_clock(store.clone(), registry.clone(), clock.clone());
        let invalidation = InvalidationDispatcher::with_clock(store, registry, clock).tracking(&queries);
        Self {
            queries,
            invalidation: Arc::new(invalidation),
        }
    }

    pub fn queries(&self) -> &CachedQueryFactory {
        &self.queries
    }

    pub fn invalidation(&self) -> &InvalidationDispatcher {
        &self.invalidation
    }

    pub fn registry(&self) -> &ProfileRegistry {
        self.queries.registry()
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        self.queries.store()
    }
}
