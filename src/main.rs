//! # Revalidator - Main Entry Point
//!
//! Loads configuration, installs logging and prints the resolved cache profiles.
//! Given a resource path argument (for example `/posts`), it also fetches that resource
//! twice through a cached query and reports whether the second read was served from cache.
//!
//! Configuration comes from `REVALIDATOR_CONFIG_PATH` when set, otherwise from defaults
//! with environment overrides applied.

use std::sync::Arc;
use tracing::{error, info};

use revalidator::api::{HttpTransport, RequestOptions, ServerApi};
use revalidator::caching::{CacheLayer, CacheStore, CachedQueryOptions, InMemoryCache};
use revalidator::observability::init_logging;
use revalidator::{CacheResult, RevalidatorConfig};

#[tokio::main]
async fn main() -> CacheResult<()> {
    let config = load_config().await?;
    init_logging(&config.logging)?;

    info!("Starting revalidator v{}", env!("CARGO_PKG_VERSION"));

    let registry = config.cache.registry()?;
    for name in registry.names() {
        if let Some(profile) = registry.get(name) {
            println!("{:<10} {}", name, profile);
        }
    }

    let Some(resource) = std::env::args().nth(1) else {
        return Ok(());
    };

    let store = Arc::new(InMemoryCache::new(config.cache.store_config()));
    let sweeper = store.spawn_sweeper();
    let cache = CacheLayer::new(store.clone(), registry);

    let transport = Arc::new(HttpTransport::new(
        config.api.origin.clone(),
        config.api.request_timeout,
    )?);
    let api = ServerApi::with_base_url(config.api.base_path.clone(), transport)
        .create_resource_api(&resource);

    let query = api.cached_get::<serde_json::Value>(
        cache.queries(),
        None,
        RequestOptions::default(),
        CachedQueryOptions::default().tags([resource.clone()]),
    )?;

    let body = query.call().await.map_err(|e| {
        error!(resource = %resource, error = %e, "Fetch failed");
        e
    })?;
    query.call().await?;

    let stats = store.stats().await?;
    info!(key = %query.key(), hits = stats.hits, misses = stats.misses, "Cached read complete");
    println!("{}", serde_json::to_string_pretty(&body)?);

    sweeper.abort();
    Ok(())
}

async fn load_config() -> CacheResult<RevalidatorConfig> {
    match std::env::var("REVALIDATOR_CONFIG_PATH") {
        Ok(path) => RevalidatorConfig::load(&path).await,
        Err(_) => {
            let mut config = RevalidatorConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }
}
