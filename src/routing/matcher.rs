//! Prefix matching for proxy classification.
//!
//! # Responsibilities
//! - Match the request target (path + query) against a path prefix
//! - Combine prefixes with OR semantics, first match wins
//!
//! # Design Decisions
//! - Matching is case-insensitive; prefixes are lowercased once at construction
//! - Ordered linear scan: prefix lists hold a handful of entries
//! - No regex in the hot path

/// Trait for matching a request target against a condition.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request target (path and query) matches.
    fn matches(&self, target: &str) -> bool;
}

/// Matches a single path prefix, ignoring case.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    /// Create a new path prefix matcher.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().to_lowercase(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, target: &str) -> bool {
        target
            .get(..self.prefix.len())
            .map(|head| head.eq_ignore_ascii_case(&self.prefix))
            .unwrap_or(false)
    }
}

/// Combines prefix matchers with OR semantics.
#[derive(Debug, Clone, Default)]
pub struct PrefixList {
    matchers: Vec<PathPrefixMatcher>,
}

impl PrefixList {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matchers: prefixes.into_iter().map(PathPrefixMatcher::new).collect(),
        }
    }

    /// The first prefix matching `target`, in registration order.
    pub fn first_match(&self, target: &str) -> Option<&str> {
        self.matchers
            .iter()
            .find(|m| m.matches(target))
            .map(PathPrefixMatcher::prefix)
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}

impl Matcher for PrefixList {
    fn matches(&self, target: &str) -> bool {
        self.first_match(target).is_some()
    }
}
