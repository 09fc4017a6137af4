//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate the upstream host, prefixes, and route patterns
//! - Validate value ranges (timeouts > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;
use crate::routing::router::RoutePattern;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    match url::Url::parse(&config.sitecore.api_host) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => errors.push(ValidationError::new(
            "sitecore.api_host",
            format!("unsupported scheme '{}'", url.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new("sitecore.api_host", e.to_string())),
    }

    for (field, path) in [
        ("sitecore.layout_service_prefix", &config.sitecore.layout_service_prefix),
        ("sitecore.layout_render_path", &config.sitecore.layout_render_path),
    ] {
        if !path.starts_with('/') {
            errors.push(ValidationError::new(field, "must start with '/'"));
        }
    }

    if config.proxy.timeout_ms == 0 {
        errors.push(ValidationError::new("proxy.timeout_ms", "must be greater than 0"));
    }

    for prefix in config.proxy.all_do_not_proxy_prefixes() {
        if !prefix.starts_with('/') {
            errors.push(ValidationError::new(
                "proxy.do_not_proxy_prefixes",
                format!("'{}' must start with '/'", prefix),
            ));
        }
    }
    for prefix in config.proxy.all_direct_proxy_prefixes() {
        if !prefix.starts_with('/') {
            errors.push(ValidationError::new(
                "proxy.direct_proxy_prefixes",
                format!("'{}' must start with '/'", prefix),
            ));
        }
    }

    for pattern in &config.proxy.route_patterns {
        if let Err(e) = RoutePattern::compile(pattern) {
            errors.push(ValidationError::new("proxy.route_patterns", e.to_string()));
        }
    }

    if let Some(method) = &config.proxy.method {
        if axum::http::Method::from_bytes(method.as_bytes()).is_err() {
            errors.push(ValidationError::new(
                "proxy.method",
                format!("'{}' is not a valid HTTP method", method),
            ));
        }
    }

    for name in config.proxy.headers.keys() {
        if axum::http::HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(ValidationError::new(
                "proxy.headers",
                format!("'{}' is not a valid header name", name),
            ));
        }
    }

    if let Some(protocol) = &config.proxy.protocol_rewrite {
        if protocol != "http" && protocol != "https" {
            errors.push(ValidationError::new(
                "proxy.protocol_rewrite",
                "must be 'http' or 'https'",
            ));
        }
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ProxyConfig::default();
        config.sitecore.api_host = "ftp://cm.local".into();
        config.proxy.timeout_ms = 0;
        config.proxy.extra_direct_proxy_prefixes.push("media".into());
        config.proxy.route_patterns.push("/:lang([a-z/:rest*".into());
        config.proxy.protocol_rewrite = Some("gopher".into());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "sitecore.api_host",
                "proxy.timeout_ms",
                "proxy.direct_proxy_prefixes",
                "proxy.route_patterns",
                "proxy.protocol_rewrite",
            ]
        );
    }
}
