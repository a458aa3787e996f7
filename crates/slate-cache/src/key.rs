//! Query keys
//!
//! A key is an ordered tuple of segments, e.g. `["punishments", <user>]`.
//! Invalidation, cancellation and removal match by prefix, so
//! `["punishments"]` covers every per-user punishment key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered tuple identifying one cache entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    /// Single-segment key
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<String>) -> Self {
        Self(vec![root.into()])
    }

    /// Key from segments
    #[inline]
    #[must_use]
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Extend with one more segment
    #[inline]
    #[must_use]
    pub fn with(mut self, segment: impl fmt::Display) -> Self {
        self.0.push(segment.to_string());
        self
    }

    /// Segments of this key
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// First segment
    #[inline]
    #[must_use]
    pub fn root(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Whether `prefix` matches the leading segments of this key
    #[inline]
    #[must_use]
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}
