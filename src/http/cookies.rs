//! `set-cookie` parsing and re-serialization.
//!
//! # Responsibilities
//! - Parse upstream `set-cookie` values into discrete cookie records
//! - Run the cookie hook over the records
//! - Drop an empty analytics cookie so it cannot erase the client's copy
//! - Serialize back, name=value first, attributes in their original order
//!
//! # Design Decisions
//! - Values and attribute names are kept verbatim (no re-encoding)
//! - `HttpOnly` and `Secure` are always written as bare flags
//! - Header values that are not valid UTF-8 pass through untouched

use axum::http::HeaderValue;

use crate::hooks::CookieHook;

/// Tracking cookie the upstream sometimes re-issues with an empty value.
pub const ANALYTICS_COOKIE: &str = "SC_ANALYTICS_GLOBAL_COOKIE";

const FLAG_ATTRIBUTES: [&str; 2] = ["httponly", "secure"];

/// One cookie attribute, e.g. `Path=/` or `HttpOnly`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieAttribute {
    pub name: String,
    pub value: Option<String>,
}

impl CookieAttribute {
    fn is_flag(&self) -> bool {
        FLAG_ATTRIBUTES.iter().any(|f| self.name.eq_ignore_ascii_case(f))
    }
}

/// A single parsed `set-cookie` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub attributes: Vec<CookieAttribute>,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            attributes: Vec::new(),
        }
    }

    /// Parse a `set-cookie` header value.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split(';');
        let pair = parts.next().unwrap_or_default();
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
            None => (String::new(), pair.trim().to_string()),
        };

        let attributes = parts
            .filter(|part| !part.trim().is_empty())
            .map(|part| match part.split_once('=') {
                Some((key, value)) => CookieAttribute {
                    name: key.trim().to_string(),
                    value: Some(value.trim().to_string()),
                },
                None => CookieAttribute {
                    name: part.trim().to_string(),
                    value: None,
                },
            })
            .collect();

        Self {
            name,
            value,
            attributes,
        }
    }

    /// Case-insensitive attribute lookup.
    pub fn attribute(&self, name: &str) -> Option<&CookieAttribute> {
        self.attributes.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Set an attribute, replacing an existing one in place or appending it.
    pub fn set_attribute(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(str::to_string);
        match self.attributes.iter_mut().find(|a| a.name.eq_ignore_ascii_case(name)) {
            Some(existing) => existing.value = value,
            None => self.attributes.push(CookieAttribute {
                name: name.to_string(),
                value,
            }),
        }
    }

    pub fn remove_attribute(&mut self, name: &str) {
        self.attributes.retain(|a| !a.name.eq_ignore_ascii_case(name));
    }

    pub fn is_secure(&self) -> bool {
        self.attribute("secure").is_some()
    }

    pub fn set_secure(&mut self, secure: bool) {
        if secure {
            self.set_attribute("Secure", None);
        } else {
            self.remove_attribute("secure");
        }
    }

    pub fn is_http_only(&self) -> bool {
        self.attribute("httponly").is_some()
    }

    /// Serialize to a `set-cookie` header value.
    pub fn to_header_string(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        for attribute in &self.attributes {
            out.push_str("; ");
            match &attribute.value {
                Some(value) if !attribute.is_flag() => {
                    out.push_str(&attribute.name);
                    out.push('=');
                    out.push_str(value);
                }
                _ => out.push_str(&attribute.name),
            }
        }
        out
    }
}

impl std::fmt::Display for SetCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_header_string())
    }
}

/// Drop analytics cookies carrying an empty value.
pub fn remove_empty_analytics_cookie(cookies: &mut Vec<SetCookie>) {
    cookies.retain(|cookie| !(cookie.name == ANALYTICS_COOKIE && cookie.value.is_empty()));
}

/// Parse, hook, filter and re-serialize a response's `set-cookie` values.
pub fn rewrite_set_cookies(values: Vec<HeaderValue>, hook: Option<&CookieHook>) -> Vec<HeaderValue> {
    let mut passthrough = Vec::new();
    let mut cookies = Vec::new();
    for value in values {
        match value.to_str() {
            Ok(raw) => cookies.push(SetCookie::parse(raw)),
            Err(_) => passthrough.push(value),
        }
    }

    if let Some(hook) = hook {
        cookies = hook(cookies);
    }
    remove_empty_analytics_cookie(&mut cookies);

    let mut out: Vec<HeaderValue> = cookies
        .iter()
        .filter_map(|cookie| match HeaderValue::from_str(&cookie.to_header_string()) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(cookie = %cookie.name, error = %e, "Dropping unserializable cookie");
                None
            }
        })
        .collect();
    out.extend(passthrough);
    out
}
