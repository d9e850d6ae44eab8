//! # Revalidator
//!
//! Tagged, revalidatable data-fetching cache for server-rendered applications, plus the
//! client-side stale-while-revalidate policy that reads through it.
//!
//! ## Layout
//! - [`caching`]: cache profiles, cached queries, tag and path invalidation
//! - [`api`]: resource API clients over a pluggable [`api::Transport`]
//! - [`swr`]: client revalidation policy and the key-scoped engine consuming it
//! - [`core`]: error taxonomy and configuration
//! - [`observability`]: subscriber setup
//!
//! ```no_run
//! use std::sync::Arc;
//! use revalidator::api::{HttpTransport, ServerApi};
//! use revalidator::caching::{CacheLayer, InMemoryCache};
//! use revalidator::RevalidatorConfig;
//!
//! # async fn demo() -> revalidator::CacheResult<()> {
//! let config = RevalidatorConfig::load("revalidator.yaml").await?;
//! let store = Arc::new(InMemoryCache::new(config.cache.store_config()));
//! let cache = CacheLayer::new(store, config.cache.registry()?);
//!
//! let transport = Arc::new(HttpTransport::new(config.api.origin.clone(), config.api.request_timeout)?);
//! let posts = ServerApi::with_base_url(config.api.base_path.clone(), transport).create_resource_api("/posts");
//! # let _ = (cache, posts);
//! # Ok(())
//! # }
//! ```

/// Error types and configuration
pub mod core;

/// Logging setup
pub mod observability;

/// Server-side cache: profiles, cached queries, invalidation
pub mod caching;

/// Resource API client builder and transport
pub mod api;

/// Client revalidation policy and engine
pub mod swr;

pub use core::config::RevalidatorConfig;
pub use core::error::{CacheError, CacheResult};
