//! # Configuration Module
//!
//! Process-wide settings for the cache layer, the resource API and the client policy.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Environment variable override support (`REVALIDATOR_<SECTION>_<FIELD>`)
//! - Validation that reports every problem at once
//!
//! Every section has defaults, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::api::client::DEFAULT_BASE_URL;
use crate::caching::profiles::{CacheProfile, ProfileRegistry, DEFAULT_PROFILE};
use crate::caching::stores::InMemoryCacheConfig;
use crate::core::error::{CacheError, CacheResult};
use crate::swr::RevalidationPolicy;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevalidatorConfig {
    /// Resource API settings
    pub api: ApiConfig,

    /// Server-side cache settings
    pub cache: CacheConfig,

    /// Client revalidation policy
    pub client: RevalidationPolicy,

    /// Log output settings
    pub logging: LoggingConfig,
}

/// Resource API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Prefix every resource path is appended to
    pub base_path: String,

    /// Origin relative URLs resolve against; required for HTTP outside a host that
    /// resolves relative URLs itself
    pub origin: Option<Url>,

    /// Default per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_BASE_URL.to_string(),
            origin: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Server-side cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Profile applied to queries that name none
    pub default_profile: String,

    /// Profiles added to, or replacing entries of, the built-in table
    pub profiles: HashMap<String, CacheProfile>,

    /// Reject unknown profile names instead of falling back to `default`
    pub strict_profiles: bool,

    /// How often expired entries are swept from the store
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Store capacity; the oldest entries are evicted beyond it
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let store = InMemoryCacheConfig::default();
        Self {
            default_profile: DEFAULT_PROFILE.to_string(),
            profiles: HashMap::new(),
            strict_profiles: true,
            sweep_interval: store.sweep_interval,
            max_entries: store.max_entries,
        }
    }
}

impl CacheConfig {
    /// Built-in profiles plus configured overrides.
    ///
    /// A non-default `default_profile` rebinds `default` to that profile's lifetime.
    pub fn registry(&self) -> CacheResult<ProfileRegistry> {
        let mut registry = ProfileRegistry::builtin()
            .with_profiles(self.profiles.iter().map(|(name, profile)| (name.clone(), *profile)))
            .with_strict(self.strict_profiles);

        if self.default_profile != DEFAULT_PROFILE {
            let profile = registry.get(&self.default_profile).ok_or_else(|| {
                CacheError::config(format!("Unknown default profile '{}'", self.default_profile))
            })?;
            registry = registry.with_profiles([(DEFAULT_PROFILE.to_string(), profile)]);
        }

        Ok(registry)
    }

    pub fn store_config(&self) -> InMemoryCacheConfig {
        InMemoryCacheConfig {
            max_entries: self.max_entries,
            sweep_interval: self.sweep_interval,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(CacheError::config(format!("Unknown log format '{}'", other))),
        }
    }
}

impl RevalidatorConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: RevalidatorConfig = serde_yaml::from_str(&content)
            .map_err(|e| CacheError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: RevalidatorConfig = serde_json::from_str(&content)
            .map_err(|e| CacheError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load by extension: `.json` as JSON, anything else as YAML
    pub async fn load<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            Self::load_from_json(path).await
        } else {
            Self::load_from_file(path).await
        }
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: REVALIDATOR_<SECTION>_<FIELD>
    /// For example: REVALIDATOR_API_BASE_PATH=/v2
    pub fn apply_env_overrides(&mut self) -> CacheResult<()> {
        use std::env;

        // API overrides
        if let Ok(base_path) = env::var("REVALIDATOR_API_BASE_PATH") {
            self.api.base_path = base_path;
        }

        if let Ok(origin) = env::var("REVALIDATOR_API_ORIGIN") {
            self.api.origin = Some(
                Url::parse(&origin)
                    .map_err(|e| CacheError::config(format!("Invalid REVALIDATOR_API_ORIGIN: {}", e)))?,
            );
        }

        if let Ok(timeout) = env::var("REVALIDATOR_API_REQUEST_TIMEOUT") {
            self.api.request_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                CacheError::config(format!("Invalid REVALIDATOR_API_REQUEST_TIMEOUT: {}", e))
            })?;
        }

        // Cache overrides
        if let Ok(profile) = env::var("REVALIDATOR_CACHE_DEFAULT_PROFILE") {
            self.cache.default_profile = profile;
        }

        if let Ok(strict) = env::var("REVALIDATOR_CACHE_STRICT_PROFILES") {
            self.cache.strict_profiles = strict.parse().map_err(|e| {
                CacheError::config(format!("Invalid REVALIDATOR_CACHE_STRICT_PROFILES: {}", e))
            })?;
        }

        // Logging overrides
        if let Ok(level) = env::var("REVALIDATOR_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("REVALIDATOR_LOG_FORMAT") {
            self.logging.format = format
                .parse()
                .map_err(|e| CacheError::config(format!("Invalid REVALIDATOR_LOG_FORMAT: {}", e)))?;
        }

        // Client policy overrides
        if let Ok(count) = env::var("REVALIDATOR_CLIENT_ERROR_RETRY_COUNT") {
            self.client.error_retry_count = count.parse().map_err(|e| {
                CacheError::config(format!("Invalid REVALIDATOR_CLIENT_ERROR_RETRY_COUNT: {}", e))
            })?;
        }

        if let Ok(interval) = env::var("REVALIDATOR_CLIENT_DEDUPING_INTERVAL") {
            self.client.deduping_interval = humantime::parse_duration(&interval).map_err(|e| {
                CacheError::config(format!("Invalid REVALIDATOR_CLIENT_DEDUPING_INTERVAL: {}", e))
            })?;
        }

        Ok(())
    }

    /// Validate the whole configuration, reporting every problem in one error
    pub fn validate(&self) -> CacheResult<()> {
        let mut errors = Vec::new();

        // API
        if !self.api.base_path.is_empty() && self.api.base_path.ends_with('/') {
            errors.push(format!(
                "api.base_path must not end with '/': {}",
                self.api.base_path
            ));
        }

        if self.api.request_timeout.is_zero() {
            errors.push("api.request_timeout must be greater than 0".to_string());
        }

        if let Some(origin) = &self.api.origin {
            if origin.cannot_be_a_base() {
                errors.push(format!("api.origin cannot be used as a base URL: {}", origin));
            }
        }

        // Cache
        let builtin = ProfileRegistry::builtin();
        let mut known: Vec<&str> = builtin.names();
        known.extend(self.cache.profiles.keys().map(String::as_str));
        if !known.contains(&self.cache.default_profile.as_str()) {
            errors.push(format!(
                "cache.default_profile '{}' is not a known profile",
                self.cache.default_profile
            ));
        }

        for (name, profile) in &self.cache.profiles {
            if name.is_empty() {
                errors.push("cache.profiles contains an empty profile name".to_string());
            }
            if profile.stale > profile.expire && !profile.is_mutation() {
                errors.push(format!(
                    "cache profile '{}' has stale ({}) beyond expire ({})",
                    name, profile.stale, profile.expire
                ));
            }
        }

        if self.cache.max_entries == 0 {
            errors.push("cache.max_entries must be greater than 0".to_string());
        }

        if self.cache.sweep_interval.is_zero() {
            errors.push("cache.sweep_interval must be greater than 0".to_string());
        }

        // Client
        errors.extend(self.client.problems());

        // Logging
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.logging.level)),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CacheError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }
}
