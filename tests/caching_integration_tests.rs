//! # Caching System Integration Tests
//!
//! Cached queries, tag and path invalidation, and the resource API working together
//! against one in-memory store.

use revalidator::api::{HttpTransport, RequestOptions, ServerApi};
use revalidator::caching::{
    CacheLayer, CacheStore, CachedQuery, CachedQueryOptions, InMemoryCache, InMemoryCacheConfig,
    InvalidateOptions, InvalidationMode, InvalidationTarget, ManualClock, ProfileRegistry,
};
use revalidator::CacheError;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    cache: CacheLayer,
    store: Arc<InMemoryCache>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(InMemoryCache::with_clock(
        InMemoryCacheConfig::default(),
        clock.clone(),
    ));
    let cache = CacheLayer::with_clock(store.clone(), ProfileRegistry::builtin(), clock.clone());
    Harness { cache, store, clock }
}

/// Query whose value is the number of times its producer has run
fn counting(
    harness: &Harness,
    key: &str,
    tags: &[&str],
    profile: &str,
) -> (CachedQuery<usize>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let query = harness
        .cache
        .queries()
        .create_cached_query(
            move || {
                let counter = counter.clone();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
            },
            CachedQueryOptions::new([key])
                .tags(tags.iter().copied())
                .profile(profile),
        )
        .unwrap();
    (query, calls)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_reads_run_producer_once() {
    let store = Arc::new(InMemoryCache::new(InMemoryCacheConfig::default()));
    let cache = CacheLayer::new(store, ProfileRegistry::builtin());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let query = cache
        .queries()
        .create_cached_query(
            move || {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
                }
            },
            CachedQueryOptions::new(["/api/dashboard"]).profile("hours"),
        )
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let query = query.clone();
        handles.push(tokio::spawn(async move { query.call().await }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tag_invalidation_recomputes_each_entry_once() {
    let h = harness();
    let (posts, posts_calls) = counting(&h, "/api/posts", &["posts"], "hours");
    let (post, post_calls) = counting(&h, "/api/posts/1", &["posts", "post:1"], "hours");
    let (users, users_calls) = counting(&h, "/api/users", &["users"], "hours");

    for query in [&posts, &post, &users] {
        query.call().await.unwrap();
    }

    h.cache.invalidation().invalidate_data("posts", false).await.unwrap();

    assert_eq!(posts.call().await.unwrap(), 2);
    assert_eq!(post.call().await.unwrap(), 2);
    assert_eq!(users.call().await.unwrap(), 1);

    // A second read after the recompute is a plain hit
    assert_eq!(posts.call().await.unwrap(), 2);
    assert_eq!(post.call().await.unwrap(), 2);
    settle().await;

    assert_eq!(posts_calls.load(Ordering::SeqCst), 2);
    assert_eq!(post_calls.load(Ordering::SeqCst), 2);
    assert_eq!(users_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_path_invalidation_respects_segment_boundaries() {
    let h = harness();
    let (list, _) = counting(&h, "/api/posts", &[], "days");
    let (item, _) = counting(&h, "/api/posts/7", &[], "days");
    let (lookalike, _) = counting(&h, "/api/postsarchive", &[], "days");
    let (other, _) = counting(&h, "/api/users", &[], "days");

    for query in [&list, &item, &lookalike, &other] {
        query.call().await.unwrap();
    }

    let mut events = h.cache.invalidation().subscribe();
    h.cache.invalidation().invalidate_data("/api/posts", true).await.unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event.target, InvalidationTarget::path("/api/posts"));
    assert_eq!(event.mode, InvalidationMode::Evicted);
    assert_eq!(event.evicted, 2);

    let store = &h.store;
    assert!(store.get(list.key()).await.unwrap().is_none());
    assert!(store.get(item.key()).await.unwrap().is_none());
    assert!(store.get(lookalike.key()).await.unwrap().is_some());
    assert!(store.get(other.key()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_invalidating_unknown_tag_is_noop() {
    let h = harness();
    let (query, calls) = counting(&h, "/api/posts", &["posts"], "hours");
    query.call().await.unwrap();

    for _ in 0..2 {
        let event = h
            .cache
            .invalidation()
            .dispatch(InvalidationTarget::tag("never-used"))
            .await
            .unwrap();
        assert_eq!(event.affected(), 0);
    }

    query.call().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_soft_invalidation_serves_stale_once_then_refreshes() {
    let h = harness();
    let (query, calls) = counting(&h, "/api/feed", &["feed"], "hours");
    assert_eq!(query.call().await.unwrap(), 1);

    let event = h
        .cache
        .invalidation()
        .dispatch(InvalidationTarget::tag_with_profile("feed", "hours"))
        .await
        .unwrap();
    assert_eq!(event.mode, InvalidationMode::MarkedStale);
    assert_eq!(event.marked, 1);

    // Served stale while the background refresh runs
    assert_eq!(query.call().await.unwrap(), 1);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(query.call().await.unwrap(), 2);
}

#[tokio::test]
async fn test_seconds_profile_end_to_end() {
    let h = harness();
    let (query, calls) = counting(&h, "/api/prices", &["prices"], "seconds");

    assert_eq!(query.call().await.unwrap(), 1);

    h.clock.advance(Duration::from_secs(10));
    assert_eq!(query.call().await.unwrap(), 1);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    h.clock.advance(Duration::from_secs(35));
    assert_eq!(query.call().await.unwrap(), 1);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // 70s past the background refresh: past expire, blocking recompute
    h.clock.advance(Duration::from_secs(70));
    assert_eq!(query.call().await.unwrap(), 3);
}

#[tokio::test]
async fn test_mutation_profile_never_served_from_cache() {
    let h = harness();
    let (query, calls) = counting(&h, "/api/checkout", &["cart"], "mutation");

    for expected in 1..=4 {
        assert_eq!(query.call().await.unwrap(), expected);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_unknown_profile_is_rejected_in_strict_mode() {
    let h = harness();
    let err = h
        .cache
        .queries()
        .create_cached_query(
            || async { Ok(1u32) },
            CachedQueryOptions::new(["/api/x"]).profile("fortnightly"),
        )
        .unwrap_err();
    assert!(matches!(err, CacheError::Configuration { .. }));

    let err = h
        .cache
        .invalidation()
        .invalidate_data("posts", InvalidateOptions::default().with_profile("fortnightly"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Configuration { .. }));
}

#[tokio::test]
async fn test_resource_api_read_through_cache_and_invalidate() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/posts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }])))
        .expect(2)
        .mount(&server)
        .await;

    let origin = Url::parse(&server.uri()).unwrap();
    let transport = Arc::new(HttpTransport::new(Some(origin), Duration::from_secs(5)).unwrap());
    let posts = ServerApi::new(transport).create_resource_api("/posts");

    let h = harness();
    let query = posts
        .cached_get::<Value>(
            h.cache.queries(),
            None,
            RequestOptions::default(),
            CachedQueryOptions::default().tags(["posts"]).profile("hours"),
        )
        .unwrap();

    assert_eq!(query.call().await.unwrap(), json!([{ "id": 1 }]));
    assert_eq!(query.call().await.unwrap(), json!([{ "id": 1 }]));

    h.cache.invalidation().invalidate_data("posts", false).await.unwrap();
    assert_eq!(query.call().await.unwrap(), json!([{ "id": 1 }]));
}

#[tokio::test]
async fn test_producer_errors_are_not_cached() {
    let h = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let query = h
        .cache
        .queries()
        .create_cached_query(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(CacheError::http_status("/api/flaky", 502, "bad gateway"))
                    } else {
                        Ok("ok".to_string())
                    }
                }
            },
            CachedQueryOptions::new(["/api/flaky"]).profile("hours"),
        )
        .unwrap();

    let err = query.call().await.unwrap_err();
    assert_eq!(err.status(), Some(502));
    assert_eq!(query.call().await.unwrap(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidation_during_recompute_is_not_lost() {
    let h = harness();
    let source = Arc::new(AtomicUsize::new(1));
    let gate = Arc::new(tokio::sync::Notify::new());
    let query = {
        let source = source.clone();
        let gate = gate.clone();
        h.cache
            .queries()
            .create_cached_query(
                move || {
                    let source = source.clone();
                    let gate = gate.clone();
                    async move {
                        let seen = source.load(Ordering::SeqCst);
                        if seen == 1 {
                            gate.notified().await;
                        }
                        Ok(seen)
                    }
                },
                CachedQueryOptions::new(["/api/posts"]).tags(["posts"]).profile("hours"),
            )
            .unwrap()
    };

    let refreshing = tokio::spawn({
        let query = query.clone();
        async move { query.refresh().await }
    });
    settle().await;

    // The write lands while the old recompute is parked on the gate
    source.store(2, Ordering::SeqCst);
    h.cache.invalidation().invalidate_data("/api/posts", true).await.unwrap();

    assert_eq!(query.call().await.unwrap(), 2);

    gate.notify_one();
    assert_eq!(refreshing.await.unwrap().unwrap(), 1);
    settle().await;

    assert_eq!(query.call().await.unwrap(), 2);
    let entry = h.store.get(query.key()).await.unwrap().unwrap();
    assert_eq!(entry.value, json!(2));
}
