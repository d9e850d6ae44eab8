//! # Client Revalidation Policy
//!
//! Fixed, process-wide policy consumed by [`SwrClient`](super::SwrClient). It is read once
//! when the client is constructed and is not re-configurable per call site.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stale-while-revalidate policy for client reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevalidationPolicy {
    /// Reads of one key within this window share a single request
    #[serde(with = "humantime_serde")]
    pub deduping_interval: Duration,

    /// Refetch known keys when the window regains focus
    pub revalidate_on_focus: bool,

    /// Refetch known keys when connectivity returns
    pub revalidate_on_reconnect: bool,

    /// Refetch in the background when a read is served from cached data
    pub revalidate_if_stale: bool,

    /// Retries after the initial attempt before the error is surfaced
    pub error_retry_count: u32,

    /// Fixed delay between retries
    #[serde(with = "humantime_serde")]
    pub error_retry_interval: Duration,

    /// Minimum spacing between focus-triggered refetches of one key
    #[serde(with = "humantime_serde")]
    pub focus_throttle_interval: Duration,

    /// Carried for hosts with a suspense-style renderer; the engine ignores it
    pub suspense: bool,
}

impl Default for RevalidationPolicy {
    fn default() -> Self {
        Self {
            deduping_interval: Duration::from_secs(5),
            revalidate_on_focus: false,
            revalidate_on_reconnect: true,
            revalidate_if_stale: true,
            error_retry_count: 3,
            error_retry_interval: Duration::from_secs(5),
            focus_throttle_interval: Duration::from_secs(5),
            suspense: false,
        }
    }
}

impl RevalidationPolicy {
    /// Total attempts a failing fetch gets, initial attempt included
    pub fn max_attempts(&self) -> u32 {
        self.error_retry_count.saturating_add(1)
    }

    /// Validation problems, empty when the policy is usable
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.error_retry_count > 0 && self.error_retry_interval.is_zero() {
            problems.push("client.error_retry_interval must be non-zero when retries are enabled".to_string());
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RevalidationPolicy::default();
        assert!(!policy.revalidate_on_focus);
        assert!(policy.revalidate_on_reconnect);
        assert!(policy.revalidate_if_stale);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.deduping_interval, Duration::from_secs(5));
        assert!(policy.problems().is_empty());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let policy: RevalidationPolicy = serde_yaml::from_str(
            "revalidate_on_focus: true\nerror_retry_interval: 250ms\n",
        )
        .unwrap();

        assert!(policy.revalidate_on_focus);
        assert_eq!(policy.error_retry_interval, Duration::from_millis(250));
        assert_eq!(policy.error_retry_count, 3);
    }

    #[test]
    fn test_zero_retry_interval_flagged() {
        let policy = RevalidationPolicy {
            error_retry_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.problems().len(), 1);
    }
}
