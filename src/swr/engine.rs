//! # Revalidation Engine
//!
//! Key-scoped client cache driven by a [`RevalidationPolicy`]:
//!
//! - reads of one key collapse onto a single request while it is in flight and for
//!   `deduping_interval` after it started
//! - cached data is returned immediately; with `revalidate_if_stale` a background refetch
//!   is started as well
//! - failed fetches are retried `error_retry_count` times, `error_retry_interval` apart;
//!   the final error goes to subscribers, the caller and the global [`ErrorSink`]
//! - focus and reconnect signals refetch every known key, gated by the policy
//!
//! Requests are spawned onto the runtime and run to completion even if every caller
//! stops waiting. A forced request supersedes the running one; results of a superseded
//! request still reach its callers but no longer touch the key's state.

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::policy::RevalidationPolicy;
use super::sink::ErrorSink;
use crate::api::transport::{Transport, TransportRequest};
use crate::core::error::{CacheError, CacheResult};

/// Fetches the value for a key
pub type Fetcher = Arc<dyn Fn(String) -> BoxFuture<'static, CacheResult<serde_json::Value>> + Send + Sync>;

type SharedRequest = Shared<BoxFuture<'static, CacheResult<serde_json::Value>>>;

/// State changes published to subscribers of a key
#[derive(Debug, Clone, PartialEq)]
pub enum SwrEvent {
    Validating,
    Data(serde_json::Value),
    Error(CacheError),
}

struct Request {
    id: u64,
    started_at: Instant,
    settled: Arc<AtomicBool>,
    shared: SharedRequest,
}

struct KeyState {
    data: Option<serde_json::Value>,
    error: Option<CacheError>,
    updated_at: Option<Instant>,
    fetcher: Fetcher,
    request: Option<Request>,
    last_focus_revalidation: Option<Instant>,
    events: broadcast::Sender<SwrEvent>,
}

impl KeyState {
    fn new(fetcher: Fetcher) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            data: None,
            error: None,
            updated_at: None,
            fetcher,
            request: None,
            last_focus_revalidation: None,
            events,
        }
    }
}

struct Inner {
    policy: RevalidationPolicy,
    default_fetcher: Fetcher,
    sink: Arc<dyn ErrorSink>,
    keys: DashMap<String, KeyState>,
    next_request: AtomicU64,
}

/// Stale-while-revalidate client cache
#[derive(Clone)]
pub struct SwrClient {
    inner: Arc<Inner>,
}

impl SwrClient {
    /// Client whose default fetcher issues a GET for the key through `transport`
    pub fn new(
        policy: RevalidationPolicy,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let fetcher: Fetcher = Arc::new(move |key: String| {
            let transport = transport.clone();
            async move { transport.send(TransportRequest::get(key)).await }.boxed()
        });
        Self::from_parts(policy, fetcher, sink)
    }

    /// Client with a custom default fetcher
    pub fn with_fetcher<F, Fut>(policy: RevalidationPolicy, fetcher: F, sink: Arc<dyn ErrorSink>) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<serde_json::Value>> + Send + 'static,
    {
        Self::from_parts(policy, box_fetcher(fetcher), sink)
    }

    fn from_parts(policy: RevalidationPolicy, default_fetcher: Fetcher, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                default_fetcher,
                sink,
                keys: DashMap::new(),
                next_request: AtomicU64::new(0),
            }),
        }
    }

    pub fn policy(&self) -> &RevalidationPolicy {
        &self.inner.policy
    }

    /// Read `key` with the default fetcher
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<T> {
        self.read(key, None).await
    }

    /// Read `key`, registering `fetcher` as the key's fetcher for later revalidations
    pub async fn get_with<T, F, Fut>(&self, key: &str, fetcher: F) -> CacheResult<T>
    where
        T: DeserializeOwned,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<serde_json::Value>> + Send + 'static,
    {
        self.read(key, Some(box_fetcher(fetcher))).await
    }

    async fn read<T: DeserializeOwned>(&self, key: &str, fetcher: Option<Fetcher>) -> CacheResult<T> {
        let pending = {
            let mut state = self
                .inner
                .keys
                .entry(key.to_string())
                .or_insert_with(|| KeyState::new(self.inner.default_fetcher.clone()));
            if let Some(fetcher) = fetcher {
                state.fetcher = fetcher;
            }

            match state.data.clone() {
                Some(data) => {
                    counter!("revalidator_client_reads_total", "outcome" => "cached").increment(1);
                    if self.inner.policy.revalidate_if_stale {
                        self.request(key, &mut state, false);
                    }
                    Err(data)
                }
                None => {
                    counter!("revalidator_client_reads_total", "outcome" => "fetch").increment(1);
                    Ok(self.request(key, &mut state, false))
                }
            }
        };

        let value = match pending {
            Ok(request) => request.await?,
            Err(cached) => cached,
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Refetch `key` now, sharing any request that is still deduplicated
    pub async fn revalidate(&self, key: &str) -> CacheResult<serde_json::Value> {
        let request = {
            let mut state = self
                .inner
                .keys
                .entry(key.to_string())
                .or_insert_with(|| KeyState::new(self.inner.default_fetcher.clone()));
            self.request(key, &mut state, false)
        };
        request.await
    }

    /// Replace the cached data for `key` (if given) and refetch, ignoring the dedup window.
    ///
    /// Used after a write so readers see the server's view of the new state.
    pub async fn mutate(
        &self,
        key: &str,
        data: Option<serde_json::Value>,
    ) -> CacheResult<serde_json::Value> {
        let request = {
            let mut state = self
                .inner
                .keys
                .entry(key.to_string())
                .or_insert_with(|| KeyState::new(self.inner.default_fetcher.clone()));
            if let Some(data) = data {
                state.data = Some(data.clone());
                state.updated_at = Some(Instant::now());
                let _ = state.events.send(SwrEvent::Data(data));
            }
            self.request(key, &mut state, true)
        };
        request.await
    }

    /// Window regained focus. Returns how many keys were revalidated.
    pub fn on_focus(&self) -> usize {
        let policy = &self.inner.policy;
        if !policy.revalidate_on_focus {
            return 0;
        }

        let now = Instant::now();
        let mut triggered = 0;
        for mut state in self.inner.keys.iter_mut() {
            let throttled = state
                .last_focus_revalidation
                .is_some_and(|at| now.duration_since(at) < policy.focus_throttle_interval);
            if throttled {
                continue;
            }

            let key = state.key().clone();
            let state = state.value_mut();
            state.last_focus_revalidation = Some(now);
            self.request(&key, state, false);
            triggered += 1;
        }

        debug!(triggered, "Focus revalidation");
        triggered
    }

    /// Network connectivity returned. Returns how many keys were revalidated.
    pub fn on_reconnect(&self) -> usize {
        if !self.inner.policy.revalidate_on_reconnect {
            return 0;
        }

        let mut triggered = 0;
        for mut state in self.inner.keys.iter_mut() {
            let key = state.key().clone();
            self.request(&key, state.value_mut(), false);
            triggered += 1;
        }

        info!(triggered, "Reconnect revalidation");
        triggered
    }

    /// Follow state changes of `key`
    pub fn subscribe(&self, key: &str) -> broadcast::Receiver<SwrEvent> {
        self.inner
            .keys
            .entry(key.to_string())
            .or_insert_with(|| KeyState::new(self.inner.default_fetcher.clone()))
            .events
            .subscribe()
    }

    pub fn cached(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.keys.get(key).and_then(|state| state.data.clone())
    }

    pub fn last_error(&self, key: &str) -> Option<CacheError> {
        self.inner.keys.get(key).and_then(|state| state.error.clone())
    }

    /// When `key` last received data
    pub fn updated_at(&self, key: &str) -> Option<Instant> {
        self.inner.keys.get(key).and_then(|state| state.updated_at)
    }

    /// Return the deduplicated request for `key`, starting one if needed.
    ///
    /// An unsettled request is shared, and a settled one until `deduping_interval`
    /// after it started. With `force` a new request always starts and replaces the
    /// current one, even if that is still running.
    fn request(&self, key: &str, state: &mut KeyState, force: bool) -> SharedRequest {
        if let Some(current) = state.request.as_ref().filter(|_| !force) {
            let settled = current.settled.load(Ordering::Acquire);
            let within_window = current.started_at.elapsed() < self.inner.policy.deduping_interval;
            if !settled || within_window {
                counter!("revalidator_client_requests_deduped_total").increment(1);
                return current.shared.clone();
            }
        }

        let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let settled = Arc::new(AtomicBool::new(false));
        let task = fetch_with_retry(
            self.inner.clone(),
            key.to_string(),
            id,
            state.fetcher.clone(),
            settled.clone(),
        );
        let shared = tokio::spawn(task)
            .map(|joined| {
                joined.unwrap_or_else(|err| {
                    Err(CacheError::producer(format!("Fetch task failed: {}", err)))
                })
            })
            .boxed()
            .shared();

        let _ = state.events.send(SwrEvent::Validating);
        state.request = Some(Request {
            id,
            started_at: Instant::now(),
            settled,
            shared: shared.clone(),
        });
        counter!("revalidator_client_requests_started_total").increment(1);
        shared
    }
}

fn box_fetcher<F, Fut>(fetcher: F) -> Fetcher
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheResult<serde_json::Value>> + Send + 'static,
{
    Arc::new(move |key: String| fetcher(key).boxed())
}

async fn fetch_with_retry(
    inner: Arc<Inner>,
    key: String,
    id: u64,
    fetcher: Fetcher,
    settled: Arc<AtomicBool>,
) -> CacheResult<serde_json::Value> {
    let max_attempts = inner.policy.max_attempts();
    let mut attempt = 0;

    let result = loop {
        attempt += 1;
        match fetcher(key.clone()).await {
            Ok(value) => break Ok(value),
            Err(err) if attempt < max_attempts => {
                debug!(
                    key = %key,
                    attempt,
                    error = %err,
                    "Fetch failed, retrying in {:?}",
                    inner.policy.error_retry_interval
                );
                sleep(inner.policy.error_retry_interval).await;
            }
            Err(err) => break Err(CacheError::retry_exhausted(key.as_str(), attempt, err)),
        }
    };

    record_result(&inner, &key, id, &result);
    settled.store(true, Ordering::Release);

    if let Err(err) = &result {
        inner.sink.report(&key, err);
    }
    result
}

fn record_result(inner: &Inner, key: &str, id: u64, result: &CacheResult<serde_json::Value>) {
    let Some(mut state) = inner.keys.get_mut(key) else {
        return;
    };
    if state.request.as_ref().map(|request| request.id) != Some(id) {
        debug!(key = %key, "Superseded request finished, result dropped");
        return;
    }

    match result {
        Ok(value) => {
            state.data = Some(value.clone());
            state.error = None;
            state.updated_at = Some(Instant::now());
            let _ = state.events.send(SwrEvent::Data(value.clone()));
        }
        Err(err) => {
            // Previously fetched data stays available.
            state.error = Some(err.clone());
            let _ = state.events.send(SwrEvent::Error(err.clone()));
        }
    }
}
