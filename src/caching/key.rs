//! # Cache Keys
//!
//! A cache key is an ordered sequence of segments. By convention the first segment is the
//! resource path (e.g. `/api/posts`) and the remaining segments carry query parameters or
//! other discriminators. Path invalidation matches against that first segment.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator used when a key has to be rendered as a single string
const SEGMENT_SEPARATOR: char = '\u{1f}';

/// Ordered composite cache key
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a segment, returning the extended key
    pub fn with_segment<S: Into<String>>(mut self, segment: S) -> Self {
        self.0.push(segment.into());
        self
    }

    /// Resource path this key is filed under
    pub fn path(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Whether this key lives under `prefix`. Matching respects path segment boundaries, so
    /// `/api/post` does not match a key filed under `/api/posts`.
    pub fn has_path_prefix(&self, prefix: &str) -> bool {
        let Some(path) = self.path() else {
            return false;
        };

        if prefix.is_empty() {
            return false;
        }

        if prefix.ends_with('/') {
            return path.starts_with(prefix);
        }

        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with(['/', '?', '#']),
            None => false,
        }
    }

    /// Flat string form, unambiguous for keys whose segments do not contain U+001F
    pub fn to_flat_string(&self) -> String {
        self.0.join(&SEGMENT_SEPARATOR.to_string())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl From<&str> for CacheKey {
    fn from(segment: &str) -> Self {
        Self(vec![segment.to_string()])
    }
}

impl From<String> for CacheKey {
    fn from(segment: String) -> Self {
        Self(vec![segment])
    }
}

impl From<Vec<String>> for CacheKey {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl From<&[&str]> for CacheKey {
    fn from(segments: &[&str]) -> Self {
        Self::new(segments.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for CacheKey {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_key_is_empty() {
        let key = CacheKey::default();
        assert!(key.is_empty());
        assert_eq!(key.path(), None);
        assert!(!key.has_path_prefix("/api"));
    }

    #[test]
    fn test_path_prefix_respects_segment_boundaries() {
        let posts = CacheKey::from(["/api/posts", "page=2"]);
        let post_detail = CacheKey::from(["/api/posts/42"]);
        let postal = CacheKey::from(["/api/postal-codes"]);

        assert!(posts.has_path_prefix("/api/posts"));
        assert!(post_detail.has_path_prefix("/api/posts"));
        assert!(!postal.has_path_prefix("/api/post"));
        assert!(!posts.has_path_prefix("/api/post"));

        assert!(postal.has_path_prefix("/api/"));
        assert!(postal.has_path_prefix("/"));
    }

    #[test]
    fn test_query_suffix_counts_as_boundary() {
        let key = CacheKey::from("/api/posts?page=1");
        assert!(key.has_path_prefix("/api/posts"));
    }

    #[test]
    fn test_empty_key_and_prefix_never_match() {
        assert!(!CacheKey::new(Vec::<String>::new()).has_path_prefix("/"));
        assert!(!CacheKey::from("/api").has_path_prefix(""));
    }

    #[test]
    fn test_segment_order_matters() {
        assert_ne!(CacheKey::from(["a", "b"]), CacheKey::from(["b", "a"]));
        assert_eq!(CacheKey::from(["a", "b"]).to_string(), "[a, b]");
    }
}
