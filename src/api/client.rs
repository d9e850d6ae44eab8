//! # Resource API Client Builder
//!
//! Binds `get`/`post`/`put`/`patch`/`remove` to a resource path so call sites never
//! build URLs or spell out method names. Every call goes straight to the [`Transport`]
//! and its result or error comes back unchanged.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use revalidator::api::{RequestOptions, ServerApi, Transport};
//! # async fn demo(transport: Arc<dyn Transport>) -> revalidator::CacheResult<()> {
//! let api = ServerApi::new(transport);
//! let posts = api.create_resource_api("/posts");
//!
//! let all: Vec<serde_json::Value> = posts.get(None, RequestOptions::default()).await?;
//! let created: serde_json::Value = posts
//!     .post("/", Some(&serde_json::json!({ "title": "hi" })), RequestOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::transport::{HttpMethod, RequestOptions, Transport, TransportRequest};
use crate::caching::{CacheKey, CachedQuery, CachedQueryFactory, CachedQueryOptions};
use crate::core::error::CacheResult;

/// Base path used when none is configured
pub const DEFAULT_BASE_URL: &str = "/api";

/// Entry point: a base URL plus the transport every resource client shares
#[derive(Clone)]
pub struct ServerApi {
    base_url: String,
    transport: Arc<dyn Transport>,
}

impl ServerApi {
    /// Client rooted at `/api`
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, transport)
    }

    pub fn with_base_url<S: Into<String>>(base_url: S, transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Bind the five operations to `resource_path`
    pub fn create_resource_api(&self, resource_path: &str) -> ResourceApi {
        ResourceApi {
            resource_url: format!("{}{}", self.base_url, resource_path),
            transport: self.transport.clone(),
        }
    }
}

/// Operations bound to one resource URL. Immutable and cheap to clone.
#[derive(Clone)]
pub struct ResourceApi {
    resource_url: String,
    transport: Arc<dyn Transport>,
}

impl ResourceApi {
    pub fn resource_url(&self) -> &str {
        &self.resource_url
    }

    /// Full URL for an optional endpoint suffix
    pub fn url(&self, endpoint: Option<&str>) -> String {
        match endpoint {
            Some(endpoint) => format!("{}{}", self.resource_url, endpoint),
            None => self.resource_url.clone(),
        }
    }

    pub async fn get<R: DeserializeOwned>(
        &self,
        endpoint: Option<&str>,
        options: RequestOptions,
    ) -> CacheResult<R> {
        self.send(HttpMethod::Get, self.url(endpoint), options, None)
            .await
    }

    pub async fn post<R: DeserializeOwned, D: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        data: Option<&D>,
        options: RequestOptions,
    ) -> CacheResult<R> {
        let body = encode(data)?;
        self.send(HttpMethod::Post, self.url(Some(endpoint)), options, body)
            .await
    }

    pub async fn put<R: DeserializeOwned, D: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        data: Option<&D>,
        options: RequestOptions,
    ) -> CacheResult<R> {
        let body = encode(data)?;
        self.send(HttpMethod::Put, self.url(Some(endpoint)), options, body)
            .await
    }

    pub async fn patch<R: DeserializeOwned, D: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        data: Option<&D>,
        options: RequestOptions,
    ) -> CacheResult<R> {
        let body = encode(data)?;
        self.send(HttpMethod::Patch, self.url(Some(endpoint)), options, body)
            .await
    }

    /// DELETE
    pub async fn remove<R: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> CacheResult<R> {
        self.send(HttpMethod::Delete, self.url(Some(endpoint)), options, None)
            .await
    }

    /// Wrap a GET in a cached query.
    ///
    /// When `query_options` has an empty key, the key becomes the request URL followed by
    /// one `name=value` segment per query parameter.
    pub fn cached_get<R>(
        &self,
        factory: &CachedQueryFactory,
        endpoint: Option<&str>,
        options: RequestOptions,
        mut query_options: CachedQueryOptions,
    ) -> CacheResult<CachedQuery<R>>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let url = self.url(endpoint);
        if query_options.key.is_empty() {
            query_options.key = options
                .query
                .iter()
                .fold(CacheKey::from(url.clone()), |key, (name, value)| {
                    key.with_segment(format!("{}={}", name, value))
                });
        }

        let api = self.clone();
        factory.create_cached_query(
            move || {
                let api = api.clone();
                let url = url.clone();
                let options = options.clone();
                async move { api.send(HttpMethod::Get, url, options, None).await }
            },
            query_options,
        )
    }

    async fn send<R: DeserializeOwned>(
        &self,
        method: HttpMethod,
        url: String,
        options: RequestOptions,
        body: Option<serde_json::Value>,
    ) -> CacheResult<R> {
        let request = TransportRequest::new(method, url)
            .with_options(options)
            .with_body(body);
        let value = self.transport.send(request).await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn encode<D: Serialize + ?Sized>(data: Option<&D>) -> CacheResult<Option<serde_json::Value>> {
    data.map(serde_json::to_value).transpose().map_err(Into::into)
}
