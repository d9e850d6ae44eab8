//! # Structured Logging
//!
//! Installs the process-wide `tracing` subscriber from [`LoggingConfig`].
//!
//! `RUST_LOG`, when set, takes precedence over the configured level. Installing twice is
//! harmless: the second call logs a warning and keeps the first subscriber.

use tracing::{info, warn};
use tracing_subscriber::{
    fmt::{self},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::core::config::{LogFormat, LoggingConfig};
use crate::core::error::{CacheError, CacheResult};

/// Filter from `RUST_LOG`, falling back to the configured level
pub fn build_filter(config: &LoggingConfig) -> CacheResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    EnvFilter::try_new(config.level.to_lowercase())
        .map_err(|e| CacheError::config(format!("Invalid log level '{}': {}", config.level, e)))
}

/// Initialize the tracing subscriber
pub fn init_logging(config: &LoggingConfig) -> CacheResult<()> {
    let env_filter = build_filter(config)?;

    let installed = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    // Don't fail if a subscriber is already installed
    if installed.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(level = %config.level, format = ?config.format, "Structured logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_tolerated() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&LoggingConfig {
            format: LogFormat::Json,
            ..config
        })
        .is_ok());
    }

    #[test]
    fn test_filter_accepts_configured_level() {
        let config = LoggingConfig {
            level: "DEBUG".to_string(),
            ..Default::default()
        };
        assert!(build_filter(&config).is_ok());
    }
}
