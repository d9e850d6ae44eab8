//! # Cached Query Factory
//!
//! Wraps a zero-argument async producer with a cache key, a tag set and a lifetime, and
//! returns a [`CachedQuery`] whose `call` serves from the store with stale-while-revalidate
//! semantics:
//!
//! - fresh entry: served, producer not invoked
//! - stale entry: served, recompute scheduled in the background
//! - expired or missing entry: caller waits on a recompute
//!
//! Recomputes for one key are deduplicated: while one is in flight every other caller
//! attaches to it. Recomputes are spawned onto the runtime, so they run to completion even
//! when every caller has gone away.
//!
//! An invalidation that matches a running recompute detaches it: later reads start a new
//! recompute, and the detached one never writes its result to the store.

use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::key::CacheKey;
use super::profiles::{CacheProfile, ProfileRegistry, ProfileSpec};
use super::stores::{CacheEntry, CacheStore, Freshness, Lifetime};
use crate::core::error::{CacheError, CacheResult};

type Producer<T> = Arc<dyn Fn() -> BoxFuture<'static, CacheResult<T>> + Send + Sync>;
type Computation = Shared<BoxFuture<'static, CacheResult<serde_json::Value>>>;

/// Refresh policy of a single cached query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Revalidate {
    /// Use the timings of the query's profile
    #[default]
    Profile,

    /// Consider the value stale after this many seconds. Zero disables caching, like
    /// the `mutation` profile.
    After(u64),

    /// Cache indefinitely until explicitly invalidated
    Never,
}

impl From<u64> for Revalidate {
    fn from(seconds: u64) -> Self {
        Self::After(seconds)
    }
}

impl From<bool> for Revalidate {
    /// `false` disables time-based revalidation; `true` defers to the profile
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Profile
        } else {
            Self::Never
        }
    }
}

/// Options for [`CachedQueryFactory::create_cached_query`]
#[derive(Debug, Clone, Default)]
pub struct CachedQueryOptions {
    pub key: CacheKey,
    pub tags: Vec<String>,
    pub revalidate: Revalidate,
    pub profile: ProfileSpec,
}

impl CachedQueryOptions {
    pub fn new<K: Into<CacheKey>>(key: K) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn revalidate<R: Into<Revalidate>>(mut self, revalidate: R) -> Self {
        self.revalidate = revalidate.into();
        self
    }

    pub fn profile<P: Into<ProfileSpec>>(mut self, profile: P) -> Self {
        self.profile = profile.into();
        self
    }
}

/// Why a recompute was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComputeReason {
    Miss,
    Background,
}

impl fmt::Display for ComputeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Miss => f.write_str("miss"),
            Self::Background => f.write_str("background"),
        }
    }
}

struct Slot {
    id: u64,
    tags: BTreeSet<String>,
    cancelled: Arc<AtomicBool>,
    computation: Computation,
}

/// Running recomputes by key, shared between a factory and the dispatchers tracking it
#[derive(Default)]
pub(crate) struct InFlight {
    next_id: AtomicU64,
    computations: Mutex<HashMap<CacheKey, Slot>>,
}

impl InFlight {
    /// Detach every running recompute carrying `tag`
    pub(crate) fn cancel_tag(&self, tag: &str) -> usize {
        self.cancel_where(|_, slot| slot.tags.contains(tag))
    }

    /// Detach every running recompute filed under `prefix`
    pub(crate) fn cancel_path(&self, prefix: &str) -> usize {
        self.cancel_where(|key, _| key.has_path_prefix(prefix))
    }

    pub(crate) fn cancel_all(&self) -> usize {
        self.cancel_where(|_, _| true)
    }

    fn cancel_where<F>(&self, matches: F) -> usize
    where
        F: Fn(&CacheKey, &Slot) -> bool,
    {
        let mut computations = self.computations.lock();
        let before = computations.len();
        computations.retain(|key, slot| {
            if matches(key, slot) {
                slot.cancelled.store(true, Ordering::Release);
                false
            } else {
                true
            }
        });
        before - computations.len()
    }
}

/// Builds cached queries over a shared store.
///
/// Cloning is cheap; clones share the store, the profile registry and the in-flight table.
#[derive(Clone)]
pub struct CachedQueryFactory {
    store: Arc<dyn CacheStore>,
    registry: Arc<ProfileRegistry>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<InFlight>,
}

impl CachedQueryFactory {
    pub fn new(store: Arc<dyn CacheStore>, registry: Arc<ProfileRegistry>) -> Self {
        Self::with_clock(store, registry, Arc::new(SystemClock))
    }

    /// Use an injected clock; it should be the same clock the store ages entries with
    pub fn with_clock(
        store: Arc<dyn CacheStore>,
        registry: Arc<ProfileRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }

    pub(crate) fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Wrap `producer` into a memoized, revalidatable query.
    ///
    /// The profile is resolved here, so an unknown profile name fails at construction
    /// rather than on first read.
    pub fn create_cached_query<T, F, Fut>(
        &self,
        producer: F,
        options: CachedQueryOptions,
    ) -> CacheResult<CachedQuery<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        if options.key.is_empty() {
            return Err(CacheError::config("Cached query key must have at least one segment"));
        }

        let lifetime = self.resolve_lifetime(&options)?;
        let producer: Producer<T> = Arc::new(move || producer().boxed());

        debug!(key = %options.key, tags = ?options.tags, ?lifetime, "Created cached query");

        Ok(CachedQuery {
            factory: self.clone(),
            producer,
            key: options.key,
            tags: options.tags.into_iter().collect(),
            lifetime,
            _marker: PhantomData,
        })
    }

    fn resolve_lifetime(&self, options: &CachedQueryOptions) -> CacheResult<Lifetime> {
        match options.revalidate {
            Revalidate::Never => Ok(Lifetime::Indefinite),
            Revalidate::Profile => Ok(Lifetime::Timed(self.registry.resolve(&options.profile)?)),
            Revalidate::After(0) => Ok(Lifetime::Timed(CacheProfile::mutation())),
            Revalidate::After(seconds) => {
                let profile = self.registry.resolve(&options.profile)?;
                Ok(Lifetime::Timed(CacheProfile::new(
                    seconds,
                    seconds,
                    profile.expire.max(seconds),
                )))
            }
        }
    }

    /// Return the in-flight computation for `key`, starting one if there is none
    fn computation(
        &self,
        key: &CacheKey,
        tags: &BTreeSet<String>,
        lifetime: Lifetime,
        produce: BoxFuture<'static, CacheResult<serde_json::Value>>,
        reason: ComputeReason,
    ) -> (Computation, bool) {
        let mut computations = self.in_flight.computations.lock();
        if let Some(slot) = computations.get(key) {
            counter!("revalidator_query_computations_joined_total").increment(1);
            return (slot.computation.clone(), false);
        }

        let id = self.in_flight.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = {
            let store = self.store.clone();
            let clock = self.clock.clone();
            let in_flight = self.in_flight.clone();
            let key = key.clone();
            let tags = tags.clone();
            let cancelled = cancelled.clone();

            async move {
                let result =
                    run_computation(&*store, &*clock, &key, tags, lifetime, &cancelled, produce).await;

                let mut computations = in_flight.computations.lock();
                if computations.get(&key).is_some_and(|slot| slot.id == id) {
                    computations.remove(&key);
                }
                drop(computations);

                if let Err(err) = &result {
                    match reason {
                        ComputeReason::Background => {
                            warn!(key = %key, error = %err, "Background revalidation failed, keeping stale entry")
                        }
                        ComputeReason::Miss => debug!(key = %key, error = %err, "Cached query producer failed"),
                    }
                }
                result
            }
        };

        // The lock is still held, so the task cannot clear its slot before it is inserted.
        let handle = tokio::spawn(task);
        let computation: Computation = handle
            .map(|joined| {
                joined.unwrap_or_else(|err| {
                    Err(CacheError::producer(format!("Computation task failed: {}", err)))
                })
            })
            .boxed()
            .shared();

        counter!("revalidator_query_computations_started_total", "reason" => reason.to_string())
            .increment(1);
        computations.insert(
            key.clone(),
            Slot {
                id,
                tags: tags.clone(),
                cancelled,
                computation: computation.clone(),
            },
        );
        (computation, true)
    }
}

async fn run_computation(
    store: &dyn CacheStore,
    clock: &dyn Clock,
    key: &CacheKey,
    tags: BTreeSet<String>,
    lifetime: Lifetime,
    cancelled: &AtomicBool,
    produce: BoxFuture<'static, CacheResult<serde_json::Value>>,
) -> CacheResult<serde_json::Value> {
    // A computation that finished just before this one started may already have
    // refreshed the entry.
    if let Some(entry) = store.get(key).await? {
        if entry.freshness(clock.now()) == Freshness::Fresh {
            return Ok(entry.value);
        }
    }

    let value = produce.await?;
    if cancelled.load(Ordering::Acquire) {
        debug!(key = %key, "Invalidated while computing, result not cached");
        return Ok(value);
    }

    let entry = CacheEntry::new(key.clone(), value.clone(), tags, clock.now(), lifetime);
    store.set(entry).await?;

    // An invalidation may have landed between the check and the write.
    if cancelled.load(Ordering::Acquire) {
        store.evict(key).await?;
    }
    Ok(value)
}

/// A memoized, revalidatable producer
pub struct CachedQuery<T> {
    factory: CachedQueryFactory,
    producer: Producer<T>,
    key: CacheKey,
    tags: BTreeSet<String>,
    lifetime: Lifetime,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for CachedQuery<T> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            producer: self.producer.clone(),
            key: self.key.clone(),
            tags: self.tags.clone(),
            lifetime: self.lifetime,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for CachedQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedQuery")
            .field("key", &self.key)
            .field("tags", &self.tags)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl<T> CachedQuery<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// Read through the cache
    pub async fn call(&self) -> CacheResult<T> {
        let store = &self.factory.store;
        let now = self.factory.clock.now();

        if let Some(entry) = store.get(&self.key).await? {
            match entry.freshness(now) {
                Freshness::Fresh => {
                    counter!("revalidator_query_reads_total", "outcome" => "hit").increment(1);
                    return decode(entry.value);
                }
                Freshness::Stale => {
                    counter!("revalidator_query_reads_total", "outcome" => "stale").increment(1);
                    let (_, started) = self.start(ComputeReason::Background);
                    if started {
                        debug!(key = %self.key, "Serving stale entry, revalidating in background");
                    }
                    return decode(entry.value);
                }
                Freshness::Expired => {}
            }
        }

        counter!("revalidator_query_reads_total", "outcome" => "miss").increment(1);
        let (computation, _) = self.start(ComputeReason::Miss);
        decode(computation.await?)
    }

    /// Recompute now, replacing the stored entry on success
    pub async fn refresh(&self) -> CacheResult<T> {
        self.factory.store.evict(&self.key).await?;
        let (computation, _) = self.start(ComputeReason::Miss);
        decode(computation.await?)
    }

    fn start(&self, reason: ComputeReason) -> (Computation, bool) {
        let producer = self.producer.clone();
        let produce = async move {
            let value = producer().await?;
            Ok(serde_json::to_value(value)?)
        }
        .boxed();

        self.factory
            .computation(&self.key, &self.tags, self.lifetime, produce, reason)
    }
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> CacheResult<T> {
    Ok(serde_json::from_value(value)?)
}
