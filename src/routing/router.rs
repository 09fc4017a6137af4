//! App route table.
//!
//! # Responsibilities
//! - Compile route patterns (`/:name`, `/:name(regex)`, `?`, `*`, `+` modifiers)
//! - Look up the first pattern matching a request path
//! - Resolve a match into the layout service route and language
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Each registered pattern is inserted in front of the previous ones, so
//!   patterns registered least-complex first end up matched most-complex first
//! - Matching is case-insensitive and tolerates one trailing slash
//! - Unmatched paths resolve to the root route `/` rather than failing

use std::collections::BTreeMap;

use percent_encoding::percent_decode_str;
use regex::Regex;

/// Parameter carrying the layout service item path.
pub const ROUTE_PARAM: &str = "sitecoreRoute";

/// Parameters carrying the language, checked in order.
pub const LANGUAGE_PARAMS: [&str; 2] = ["lang", "language"];

const DEFAULT_SEGMENT: &str = "[^/]+?";

/// Error raised for a malformed route pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid route pattern '{pattern}': {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct Param {
    name: String,
    group: String,
}

/// A compiled route pattern.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    source: String,
    regex: Regex,
    params: Vec<Param>,
}

impl RoutePattern {
    /// Compile a pattern such as `/:lang([a-z]{2})/:sitecoreRoute*`.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let fail = |reason: &str| PatternError {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let chars: Vec<char> = pattern.chars().collect();
        let mut source = String::from("(?i)^");
        let mut literal = String::new();
        let mut params = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '\\' if i + 1 < chars.len() => {
                    literal.push(chars[i + 1]);
                    i += 2;
                }
                ':' => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                        end += 1;
                    }
                    if end == start {
                        return Err(fail("missing parameter name after ':'"));
                    }
                    let name: String = chars[start..end].iter().collect();
                    i = end;

                    let mut segment = DEFAULT_SEGMENT.to_string();
                    if i < chars.len() && chars[i] == '(' {
                        let (group, next) = read_group(&chars, i).ok_or_else(|| fail("unbalanced '('"))?;
                        segment = group;
                        i = next;
                    }

                    let modifier = match chars.get(i) {
                        Some(c @ ('?' | '*' | '+')) => {
                            i += 1;
                            Some(*c)
                        }
                        _ => None,
                    };

                    // A delimiter directly before the parameter belongs to it.
                    let prefix = if literal.ends_with('/') {
                        literal.pop();
                        "/"
                    } else {
                        ""
                    };
                    source.push_str(&regex::escape(&literal));
                    literal.clear();

                    let group = format!("p{}", params.len());
                    let repeat = matches!(modifier, Some('*' | '+'));
                    let optional = matches!(modifier, Some('?' | '*'));
                    let body = if repeat {
                        format!("(?:{segment})(?:{}(?:{segment}))*", regex::escape(prefix))
                    } else {
                        format!("(?:{segment})")
                    };
                    let capture = format!("(?P<{group}>{body})");
                    let escaped_prefix = regex::escape(prefix);
                    if optional {
                        source.push_str(&format!("(?:{escaped_prefix}{capture})?"));
                    } else {
                        source.push_str(&format!("{escaped_prefix}{capture}"));
                    }

                    params.push(Param { name, group });
                }
                '(' | ')' => return Err(fail("unexpected group outside a parameter")),
                c => {
                    literal.push(c);
                    i += 1;
                }
            }
        }

        let trailing = literal.trim_end_matches('/');
        source.push_str(&regex::escape(trailing));
        source.push_str("(?:/)?$");

        let regex = Regex::new(&source).map_err(|e| fail(&e.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
            params,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a path, returning decoded parameters on success.
    pub fn match_path(&self, path: &str) -> Option<RouteMatch> {
        let captures = self.regex.captures(path)?;
        let params = self
            .params
            .iter()
            .filter_map(|param| {
                captures.name(&param.group).map(|m| {
                    let value = percent_decode_str(m.as_str()).decode_utf8_lossy().into_owned();
                    (param.name.clone(), value)
                })
            })
            .collect();
        Some(RouteMatch {
            pattern: self.source.clone(),
            params,
        })
    }
}

/// Reads a `( ... )` group starting at `open`, returning its inner text and the
/// index just past the closing paren.
fn read_group(chars: &[char], open: usize) -> Option<(String, usize)> {
    let mut depth = 0usize;
    let mut inner = String::new();
    let mut i = open;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                inner.push(c);
                if let Some(next) = chars.get(i + 1) {
                    inner.push(*next);
                }
                i += 2;
                continue;
            }
            '(' => {
                depth += 1;
                if depth > 1 {
                    inner.push(c);
                }
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((inner, i + 1));
                }
                inner.push(c);
            }
            _ => inner.push(c),
        }
        i += 1;
    }
    None
}

/// Parameters produced by a successful route match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub pattern: String,
    pub params: BTreeMap<String, String>,
}

impl RouteMatch {
    pub fn sitecore_route(&self) -> Option<&str> {
        self.params.get(ROUTE_PARAM).map(String::as_str)
    }

    pub fn language(&self) -> Option<&str> {
        LANGUAGE_PARAMS
            .iter()
            .find_map(|name| self.params.get(*name))
            .map(String::as_str)
            .filter(|lang| !lang.is_empty())
    }
}

/// The layout service route a request path resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// Item path, always with a leading slash.
    pub sitecore_route: String,
    pub language: Option<String>,
}

impl Default for ResolvedRoute {
    fn default() -> Self {
        Self {
            sitecore_route: "/".to_string(),
            language: None,
        }
    }
}

/// Ordered, immutable set of compiled route patterns.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RoutePattern>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table, registering `patterns` in the given order.
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = Self::new();
        for pattern in patterns {
            table.register(pattern.as_ref())?;
        }
        Ok(table)
    }

    /// Register a pattern ahead of every pattern registered before it.
    pub fn register(&mut self, pattern: &str) -> Result<(), PatternError> {
        self.routes.insert(0, RoutePattern::compile(pattern)?);
        Ok(())
    }

    /// Patterns in match order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(RoutePattern::as_str)
    }

    /// The first pattern matching `path`.
    pub fn match_path(&self, path: &str) -> Option<RouteMatch> {
        let path = ensure_leading_slash(path);
        self.routes.iter().find_map(|route| route.match_path(&path))
    }

    /// Resolve `path` to a layout service route, defaulting to `/`.
    pub fn resolve(&self, path: &str) -> ResolvedRoute {
        let Some(matched) = self.match_path(path) else {
            tracing::debug!(path = %path, "No app route matched, using root route");
            return ResolvedRoute::default();
        };

        let sitecore_route = matched
            .sitecore_route()
            .filter(|route| !route.is_empty())
            .map(ensure_leading_slash)
            .unwrap_or_else(|| "/".to_string());

        ResolvedRoute {
            sitecore_route,
            language: matched.language().map(str::to_string),
        }
    }
}

/// Prefix `path` with `/` when it does not already start with one.
pub fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}
