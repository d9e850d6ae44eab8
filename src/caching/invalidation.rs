//! # Cache Invalidation Module
//!
//! Dispatches invalidation by tag or by path against the shared store. Invalidation is
//! immediate: the next read of an affected key recomputes. It is also fire-and-forget, in
//! that readers already in the middle of a read finish with what they had.
//!
//! Tag invalidation defaults to the `mutation` profile, which evicts outright. A tag
//! invalidation under a profile with a non-zero expiry soft-marks matching entries instead:
//! they are served once more while a background refresh runs. Entries written with a zero
//! expiry are always evicted.
//!
//! A dispatcher tracking a [`CachedQueryFactory`] also detaches that factory's running
//! recomputes for matching keys, so a value computed before the invalidation is never
//! cached after it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::profiles::{ProfileRegistry, ProfileSpec, MUTATION_PROFILE};
use super::query::{CachedQueryFactory, InFlight};
use super::stores::CacheStore;
use crate::core::error::{CacheError, CacheResult};

/// What to invalidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidationTarget {
    /// Every entry whose key is filed under this path
    Path { path: String },

    /// Every entry carrying this tag
    Tag {
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<ProfileSpec>,
    },
}

impl InvalidationTarget {
    pub fn path<S: Into<String>>(path: S) -> Self {
        Self::Path { path: path.into() }
    }

    pub fn tag<S: Into<String>>(tag: S) -> Self {
        Self::Tag {
            tag: tag.into(),
            profile: None,
        }
    }

    pub fn tag_with_profile<S: Into<String>, P: Into<ProfileSpec>>(tag: S, profile: P) -> Self {
        Self::Tag {
            tag: tag.into(),
            profile: Some(profile.into()),
        }
    }

    fn label(&self) -> &str {
        match self {
            Self::Path { path } => path,
            Self::Tag { tag, .. } => tag,
        }
    }
}

impl fmt::Display for InvalidationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path { path } => write!(f, "path:{}", path),
            Self::Tag { tag, .. } => write!(f, "tag:{}", tag),
        }
    }
}

/// Call-site options for [`InvalidationDispatcher::invalidate_data`].
///
/// A bare `bool` converts into `{ is_path }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateOptions {
    #[serde(default)]
    pub is_path: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileSpec>,
}

impl InvalidateOptions {
    pub fn path() -> Self {
        Self {
            is_path: true,
            profile: None,
        }
    }

    pub fn with_profile<P: Into<ProfileSpec>>(mut self, profile: P) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Turn the call-site shape into a typed target
    pub fn into_target<S: Into<String>>(self, tag_or_path: S) -> InvalidationTarget {
        if self.is_path {
            InvalidationTarget::Path {
                path: tag_or_path.into(),
            }
        } else {
            InvalidationTarget::Tag {
                tag: tag_or_path.into(),
                profile: self.profile,
            }
        }
    }
}

impl From<bool> for InvalidateOptions {
    fn from(is_path: bool) -> Self {
        Self {
            is_path,
            profile: None,
        }
    }
}

/// How matching entries were treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationMode {
    Evicted,
    MarkedStale,
}

/// Record of one dispatched invalidation, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub target: InvalidationTarget,
    pub mode: InvalidationMode,
    /// Entries removed from the store
    pub evicted: usize,
    /// Entries kept but marked stale
    pub marked: usize,
    /// Running recomputes detached from their key
    #[serde(default)]
    pub cancelled: usize,
    pub dispatched_at: DateTime<Utc>,
}

impl InvalidationEvent {
    pub fn affected(&self) -> usize {
        self.evicted + self.marked
    }
}

/// Cache invalidation dispatcher
pub struct InvalidationDispatcher {
    store: Arc<dyn CacheStore>,
    registry: Arc<ProfileRegistry>,
    clock: Arc<dyn Clock>,
    in_flight: Option<Arc<InFlight>>,
    event_sender: broadcast::Sender<InvalidationEvent>,
}

impl InvalidationDispatcher {
    pub fn new(store: Arc<dyn CacheStore>, registry: Arc<ProfileRegistry>) -> Self {
        Self::with_clock(store, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CacheStore>,
        registry: Arc<ProfileRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(1000);
        Self {
            store,
            registry,
            clock,
            in_flight: None,
            event_sender,
        }
    }

    /// Also detach running recomputes of `queries` that an invalidation matches
    pub fn tracking(mut self, queries: &CachedQueryFactory) -> Self {
        self.in_flight = Some(queries.in_flight().clone());
        self
    }

    fn cancel_in_flight<F>(&self, cancel: F) -> usize
    where
        F: FnOnce(&InFlight) -> usize,
    {
        self.in_flight.as_deref().map_or(0, cancel)
    }

    /// Subscribe to invalidation events
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.event_sender.subscribe()
    }

    /// Invalidate a tag, or a path when `options` says so.
    ///
    /// Accepts either a bare `bool` (path flag) or full [`InvalidateOptions`].
    pub async fn invalidate_data<O>(&self, tag_or_path: &str, options: O) -> CacheResult<()>
    where
        O: Into<InvalidateOptions>,
    {
        let target = options.into().into_target(tag_or_path);
        self.dispatch(target).await.map(|_| ())
    }

    /// Dispatch a typed invalidation
    pub async fn dispatch(&self, target: InvalidationTarget) -> CacheResult<InvalidationEvent> {
        if target.label().is_empty() {
            return Err(CacheError::config("Invalidation target must not be empty"));
        }

        let event = match &target {
            InvalidationTarget::Path { path } => {
                let cancelled = self.cancel_in_flight(|in_flight| in_flight.cancel_path(path));
                let evicted = self.store.evict_by_path(path).await?;
                debug!(path = %path, evicted, cancelled, "Invalidated cache path");
                self.event(target, InvalidationMode::Evicted, evicted, 0, cancelled)
            }

            InvalidationTarget::Tag { tag, profile } => {
                let spec = profile
                    .clone()
                    .unwrap_or_else(|| ProfileSpec::named(MUTATION_PROFILE));
                let resolved = self.registry.resolve(&spec)?;
                let cancelled = self.cancel_in_flight(|in_flight| in_flight.cancel_tag(tag));

                if resolved.is_mutation() {
                    let evicted = self.store.evict_by_tag(tag).await?;
                    debug!(tag = %tag, profile = %spec, evicted, cancelled, "Invalidated cache tag");
                    self.event(target, InvalidationMode::Evicted, evicted, 0, cancelled)
                } else {
                    let outcome = self.store.mark_stale_by_tag(tag).await?;
                    debug!(
                        tag = %tag,
                        profile = %spec,
                        marked = outcome.marked,
                        evicted = outcome.evicted,
                        cancelled,
                        "Marked cache tag stale"
                    );
                    self.event(
                        target,
                        InvalidationMode::MarkedStale,
                        outcome.evicted,
                        outcome.marked,
                        cancelled,
                    )
                }
            }
        };

        // No subscribers is the common case.
        let _ = self.event_sender.send(event.clone());
        Ok(event)
    }

    /// Drop every cached entry
    pub async fn invalidate_all(&self) -> CacheResult<()> {
        let cancelled = self.cancel_in_flight(InFlight::cancel_all);
        self.store.clear().await?;
        info!(cancelled, "Invalidated all cache entries");
        Ok(())
    }

    fn event(
        &self,
        target: InvalidationTarget,
        mode: InvalidationMode,
        evicted: usize,
        marked: usize,
        cancelled: usize,
    ) -> InvalidationEvent {
        InvalidationEvent {
            target,
            mode,
            evicted,
            marked,
            cancelled,
            dispatched_at: self.clock.now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::clock::ManualClock;
    use crate::caching::key::CacheKey;
    use crate::caching::profiles::CacheProfile;
    use crate::caching::stores::{CacheEntry, InMemoryCache, InMemoryCacheConfig, Lifetime};
    use std::collections::BTreeSet;

    struct Fixture {
        store: Arc<InMemoryCache>,
        dispatcher: InvalidationDispatcher,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryCache::with_clock(
            InMemoryCacheConfig::default(),
            clock.clone(),
        ));
        let dispatcher = InvalidationDispatcher::with_clock(
            store.clone(),
            Arc::new(ProfileRegistry::builtin()),
            clock,
        );
        Fixture { store, dispatcher }
    }

    async fn put(fx: &Fixture, key: &[&str], tags: &[&str], lifetime: Lifetime) {
        let entry = CacheEntry::new(
            CacheKey::from(key),
            serde_json::json!(key),
            tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            fx.store.clock().now(),
            lifetime,
        );
        fx.store.set(entry).await.unwrap();
    }

    fn days() -> Lifetime {
        Lifetime::Timed(CacheProfile::new(300, 86_400, 604_800))
    }

    async fn present(fx: &Fixture, key: &[&str]) -> bool {
        fx.store.get(&CacheKey::from(key)).await.unwrap().is_some()
    }

    #[tokio::test]
    async fn test_tag_invalidation_defaults_to_eviction() {
        let fx = fixture();
        put(&fx, &["/api/posts"], &["posts"], days()).await;
        put(&fx, &["/api/posts/1"], &["posts", "post:1"], days()).await;
        put(&fx, &["/api/users"], &["users"], days()).await;

        fx.dispatcher.invalidate_data("posts", InvalidateOptions::default()).await.unwrap();

        assert!(!present(&fx, &["/api/posts"]).await);
        assert!(!present(&fx, &["/api/posts/1"]).await);
        assert!(present(&fx, &["/api/users"]).await);
    }

    #[tokio::test]
    async fn test_boolean_shorthand_selects_path() {
        let fx = fixture();
        put(&fx, &["/api/posts", "page=1"], &["posts"], days()).await;
        put(&fx, &["/api/postal"], &["posts"], days()).await;

        fx.dispatcher.invalidate_data("/api/posts", true).await.unwrap();

        assert!(!present(&fx, &["/api/posts", "page=1"]).await);
        assert!(present(&fx, &["/api/postal"]).await);
    }

    #[tokio::test]
    async fn test_path_flag_false_means_tag() {
        let fx = fixture();
        put(&fx, &["/api/posts"], &["/api/posts"], days()).await;
        put(&fx, &["/api/posts/2"], &[], days()).await;

        fx.dispatcher.invalidate_data("/api/posts", false).await.unwrap();

        assert!(!present(&fx, &["/api/posts"]).await);
        assert!(present(&fx, &["/api/posts/2"]).await);
    }

    #[tokio::test]
    async fn test_invalidating_unknown_tag_is_noop() {
        let fx = fixture();
        put(&fx, &["/api/posts"], &["posts"], days()).await;

        let event = fx.dispatcher.dispatch(InvalidationTarget::tag("nothing")).await.unwrap();
        assert_eq!(event.affected(), 0);
        assert!(present(&fx, &["/api/posts"]).await);
    }

    #[tokio::test]
    async fn test_soft_profile_marks_instead_of_evicting() {
        let fx = fixture();
        put(&fx, &["/api/posts"], &["posts"], days()).await;
        put(&fx, &["/api/cart"], &["posts"], Lifetime::Timed(CacheProfile::mutation())).await;

        let event = fx
            .dispatcher
            .dispatch(InvalidationTarget::tag_with_profile("posts", "max"))
            .await
            .unwrap();

        assert_eq!(event.mode, InvalidationMode::MarkedStale);
        assert_eq!(event.marked, 1);
        assert_eq!(event.evicted, 1);

        let entry = fx.store.get(&CacheKey::from("/api/posts")).await.unwrap().unwrap();
        assert!(entry.marked_stale);
    }

    #[tokio::test]
    async fn test_inline_zero_expiry_profile_evicts() {
        let fx = fixture();
        put(&fx, &["/api/posts"], &["posts"], days()).await;

        let options = InvalidateOptions::default()
            .with_profile(crate::caching::profiles::InlineProfile::expire(0));
        fx.dispatcher.invalidate_data("posts", options).await.unwrap();

        assert!(!present(&fx, &["/api/posts"]).await);
    }

    #[tokio::test]
    async fn test_unknown_profile_is_configuration_error() {
        let fx = fixture();
        let err = fx
            .dispatcher
            .invalidate_data("posts", InvalidateOptions::default().with_profile("fortnightly"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_empty_target_rejected() {
        let fx = fixture();
        assert!(fx.dispatcher.invalidate_data("", true).await.is_err());
    }

    #[tokio::test]
    async fn test_event_subscription() {
        let fx = fixture();
        let mut receiver = fx.dispatcher.subscribe();
        put(&fx, &["/api/posts"], &["posts"], days()).await;

        fx.dispatcher.invalidate_data("posts", false).await.unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.target, InvalidationTarget::tag("posts"));
        assert_eq!(event.mode, InvalidationMode::Evicted);
        assert_eq!(event.evicted, 1);
    }

    #[test]
    fn test_target_serializes_as_tagged_variant() {
        let json = serde_json::to_value(InvalidationTarget::path("/api/posts")).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "path", "path": "/api/posts" }));
    }
}
