//! # Cache Profile Registry
//!
//! Named cache-lifetime profiles. Each profile is a `{stale, revalidate, expire}` triple in
//! seconds. Callers refer to a profile by name or hand in an inline, possibly partial, override.
//!
//! | name       | stale | revalidate | expire     |
//! |------------|-------|------------|------------|
//! | `default`  | 5m    | 15m        | 30d        |
//! | `seconds`  | 30s   | 1s         | 60s        |
//! | `minutes`  | 5m    | 1m         | 1h         |
//! | `hours`    | 5m    | 1h         | 1d         |
//! | `days`     | 5m    | 1d         | 7d         |
//! | `weeks`    | 5m    | 7d         | 30d        |
//! | `max`      | 5m    | 30d        | 365d       |
//! | `mutation` | -     | -          | 0          |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::warn;

use crate::core::error::{CacheError, CacheResult};

/// Name of the profile used when a caller does not pick one
pub const DEFAULT_PROFILE: &str = "default";

/// Name of the profile used for invalidation after writes
pub const MUTATION_PROFILE: &str = "mutation";

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Resolved cache lifetime, all values in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheProfile {
    /// Seconds until a served value is considered outdated but still usable
    #[serde(default)]
    pub stale: u64,

    /// Seconds after which a background refresh is triggered
    #[serde(default)]
    pub revalidate: u64,

    /// Seconds after which the value is hard-evicted and must be recomputed
    pub expire: u64,
}

impl CacheProfile {
    pub const fn new(stale: u64, revalidate: u64, expire: u64) -> Self {
        Self {
            stale,
            revalidate,
            expire,
        }
    }

    /// No caching window at all
    pub const fn mutation() -> Self {
        Self::new(0, 0, 0)
    }

    /// Entries written under this profile are never served from cache
    pub fn is_mutation(&self) -> bool {
        self.expire == 0
    }

    /// Age at which a cached value stops being fresh and a background refresh is due
    pub fn refresh_after(&self) -> Duration {
        Duration::from_secs(self.stale.max(self.revalidate))
    }

    /// Age at which a cached value must no longer be served
    pub fn expire_after(&self) -> Duration {
        Duration::from_secs(self.expire)
    }

    /// Whether the intended `stale <= revalidate <= expire` ordering holds
    pub fn is_ordered(&self) -> bool {
        self.stale <= self.revalidate && self.revalidate <= self.expire
    }
}

impl fmt::Display for CacheProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stale={}s revalidate={}s expire={}s",
            self.stale, self.revalidate, self.expire
        )
    }
}

/// Inline profile override; omitted fields are filled in at resolution time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revalidate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<u64>,
}

impl InlineProfile {
    pub fn expire(seconds: u64) -> Self {
        Self {
            expire: Some(seconds),
            ..Default::default()
        }
    }
}

/// A profile reference: either a registered name or an inline override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileSpec {
    Named(String),
    Inline(InlineProfile),
}

impl ProfileSpec {
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self::Named(name.into())
    }
}

impl Default for ProfileSpec {
    fn default() -> Self {
        Self::Named(DEFAULT_PROFILE.to_string())
    }
}

impl From<&str> for ProfileSpec {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for ProfileSpec {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<InlineProfile> for ProfileSpec {
    fn from(inline: InlineProfile) -> Self {
        Self::Inline(inline)
    }
}

impl From<CacheProfile> for ProfileSpec {
    fn from(profile: CacheProfile) -> Self {
        Self::Inline(InlineProfile {
            stale: Some(profile.stale),
            revalidate: Some(profile.revalidate),
            expire: Some(profile.expire),
        })
    }
}

impl fmt::Display for ProfileSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Inline(inline) => write!(f, "inline({:?})", inline),
        }
    }
}

/// Fixed mapping from profile name to lifetime
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, CacheProfile>,
    strict: bool,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileRegistry {
    /// Registry holding the built-in profile table, with strict name validation
    pub fn builtin() -> Self {
        let profiles = [
            (DEFAULT_PROFILE, CacheProfile::new(5 * MINUTE, 15 * MINUTE, 30 * DAY)),
            ("seconds", CacheProfile::new(30, 1, MINUTE)),
            ("minutes", CacheProfile::new(5 * MINUTE, MINUTE, HOUR)),
            ("hours", CacheProfile::new(5 * MINUTE, HOUR, DAY)),
            ("days", CacheProfile::new(5 * MINUTE, DAY, 7 * DAY)),
            ("weeks", CacheProfile::new(5 * MINUTE, 7 * DAY, 30 * DAY)),
            ("max", CacheProfile::new(5 * MINUTE, 30 * DAY, 365 * DAY)),
            (MUTATION_PROFILE, CacheProfile::mutation()),
        ]
        .into_iter()
        .map(|(name, profile)| (name.to_string(), profile))
        .collect();

        Self {
            profiles,
            strict: true,
        }
    }

    /// Add or replace profiles. Out-of-order triples are accepted but logged.
    pub fn with_profiles<I>(mut self, profiles: I) -> Self
    where
        I: IntoIterator<Item = (String, CacheProfile)>,
    {
        for (name, profile) in profiles {
            if !profile.is_ordered() && !profile.is_mutation() {
                warn!(profile = %name, %profile, "Cache profile breaks stale <= revalidate <= expire ordering");
            }
            self.profiles.insert(name, profile);
        }
        self
    }

    /// Strict registries reject unknown names; lenient ones fall back to `default`
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn get(&self, name: &str) -> Option<CacheProfile> {
        self.profiles.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// Registered profile names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn fallback(&self) -> CacheProfile {
        self.get(DEFAULT_PROFILE)
            .unwrap_or_else(|| CacheProfile::new(5 * MINUTE, 15 * MINUTE, 30 * DAY))
    }

    /// Resolve a profile reference into a full lifetime triple
    pub fn resolve(&self, spec: &ProfileSpec) -> CacheResult<CacheProfile> {
        match spec {
            ProfileSpec::Named(name) => match self.get(name) {
                Some(profile) => Ok(profile),
                None if self.strict => Err(CacheError::config(format!(
                    "Unknown cache profile '{}' (known: {})",
                    name,
                    self.names().join(", ")
                ))),
                None => {
                    warn!(profile = %name, "Unknown cache profile, using default");
                    Ok(self.fallback())
                }
            },
            ProfileSpec::Inline(inline) => Ok(self.resolve_inline(inline)),
        }
    }

    /// Resolve a profile by name
    pub fn resolve_name(&self, name: &str) -> CacheResult<CacheProfile> {
        self.resolve(&ProfileSpec::named(name))
    }

    fn resolve_inline(&self, inline: &InlineProfile) -> CacheProfile {
        // An inline zero expiry means "no caching window", like `mutation`.
        let base = if inline.expire == Some(0) {
            CacheProfile::mutation()
        } else {
            self.fallback()
        };

        CacheProfile {
            stale: inline.stale.unwrap_or(base.stale),
            revalidate: inline.revalidate.unwrap_or(base.revalidate),
            expire: inline.expire.unwrap_or(base.expire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles() {
        let registry = ProfileRegistry::builtin();

        assert_eq!(registry.resolve_name("seconds").unwrap(), CacheProfile::new(30, 1, 60));
        assert_eq!(
            registry.resolve_name("max").unwrap(),
            CacheProfile::new(300, 2_592_000, 31_536_000)
        );
        assert_eq!(registry.names().len(), 8);

        let mutation = registry.resolve_name(MUTATION_PROFILE).unwrap();
        assert!(mutation.is_mutation());
        assert_eq!(mutation.stale, 0);
        assert_eq!(mutation.revalidate, 0);
    }

    #[test]
    fn test_unknown_profile_strict() {
        let registry = ProfileRegistry::builtin();
        let err = registry.resolve_name("fortnightly").unwrap_err();
        assert!(matches!(err, CacheError::Configuration { .. }));
        assert!(err.to_string().contains("fortnightly"));
    }

    #[test]
    fn test_unknown_profile_lenient_falls_back() {
        let registry = ProfileRegistry::builtin().with_strict(false);
        let profile = registry.resolve_name("fortnightly").unwrap();
        assert_eq!(profile, registry.get(DEFAULT_PROFILE).unwrap());
    }

    #[test]
    fn test_inline_partial_profile() {
        let registry = ProfileRegistry::builtin();

        let inline = InlineProfile {
            stale: Some(10),
            ..Default::default()
        };
        let profile = registry.resolve(&inline.into()).unwrap();
        assert_eq!(profile, CacheProfile::new(10, 900, 2_592_000));

        let zero = registry.resolve(&InlineProfile::expire(0).into()).unwrap();
        assert_eq!(zero, CacheProfile::mutation());
    }

    #[test]
    fn test_overrides_replace_builtins() {
        let registry = ProfileRegistry::builtin().with_profiles(vec![
            ("seconds".to_string(), CacheProfile::new(5, 10, 20)),
            ("reports".to_string(), CacheProfile::new(60, 120, 600)),
        ]);

        assert_eq!(registry.get("seconds"), Some(CacheProfile::new(5, 10, 20)));
        assert!(registry.contains("reports"));
    }

    #[test]
    fn test_refresh_threshold_uses_larger_window() {
        let seconds = CacheProfile::new(30, 1, 60);
        assert_eq!(seconds.refresh_after(), Duration::from_secs(30));
        assert!(!seconds.is_ordered());

        let default = CacheProfile::new(300, 900, 2_592_000);
        assert_eq!(default.refresh_after(), Duration::from_secs(900));
    }

    #[test]
    fn test_profile_spec_deserializes_both_shapes() {
        let named: ProfileSpec = serde_yaml::from_str("hours").unwrap();
        assert_eq!(named, ProfileSpec::named("hours"));

        let inline: ProfileSpec = serde_yaml::from_str("expire: 0").unwrap();
        assert_eq!(inline, ProfileSpec::Inline(InlineProfile::expire(0)));
    }
}
