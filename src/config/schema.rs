//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the layout proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Upstream content API connection settings.
    pub sitecore: SitecoreConfig,

    /// Classification lists and forwarding policy.
    pub proxy: ProxySettings,

    /// Extra TLS options for encrypted upstream targets.
    pub tls: TlsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3000").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
        }
    }
}

/// Upstream content API settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SitecoreConfig {
    /// Absolute base URL of the upstream host (e.g., "https://cm.example.com").
    pub api_host: String,

    /// API key sent as `sc_apikey` on transformed requests.
    pub api_key: String,

    /// Site name sent as `sc_site` on transformed requests.
    pub site_name: String,

    /// Paths under this prefix are layout service calls.
    pub layout_service_prefix: String,

    /// Endpoint that transformed page requests are rewritten to.
    pub layout_render_path: String,
}

impl Default for SitecoreConfig {
    fn default() -> Self {
        Self {
            api_host: "http://localhost".to_string(),
            api_key: String::new(),
            site_name: String::new(),
            layout_service_prefix: "/sitecore/api/layout".to_string(),
            layout_render_path: "/sitecore/api/layout/render/jss".to_string(),
        }
    }
}

/// Proxy classification and forwarding policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Path prefixes that are never proxied.
    pub do_not_proxy_prefixes: Vec<String>,

    /// Appended to `do_not_proxy_prefixes`.
    pub extra_do_not_proxy_prefixes: Vec<String>,

    /// Path prefixes forwarded verbatim to the upstream host.
    pub direct_proxy_prefixes: Vec<String>,

    /// Appended to `direct_proxy_prefixes`.
    pub extra_direct_proxy_prefixes: Vec<String>,

    /// App route patterns, least complex first.
    pub route_patterns: Vec<String>,

    /// Outgoing request timeout in milliseconds.
    pub timeout_ms: u64,

    /// Do not append x-forwarded-for / x-forwarded-proto.
    pub disable_x_forward_headers: bool,

    /// Keep the incoming host header instead of the target's.
    pub disable_change_origin: bool,

    /// Reuse upstream connections instead of forcing `connection: close`.
    pub reuse_connections: bool,

    /// Headers set on every outgoing request (highest precedence).
    pub headers: BTreeMap<String, String>,

    /// Optional method override for outgoing requests.
    pub method: Option<String>,

    /// Replace the host of matching redirect locations with this value.
    pub host_rewrite: Option<String>,

    /// Replace the host of matching redirect locations with the incoming host.
    pub auto_rewrite: bool,

    /// Replace the scheme of matching redirect locations ("http" or "https").
    pub protocol_rewrite: Option<String>,

    /// Redirect hops followed for non-POST requests.
    pub max_redirects: usize,

    /// Development mode: relax cookies issued for secure origins.
    pub dev_mode: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            do_not_proxy_prefixes: ["/static", "/fonts", "/_nuxt", "/__webpack_hmr", "/_loading/sse"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extra_do_not_proxy_prefixes: Vec::new(),
            direct_proxy_prefixes: [
                "/sitecore/api",
                "/api",
                "/-/jssmedia",
                "/-/media",
                "/_/media",
                "/_/jssmedia",
                "/layouts/system",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            extra_direct_proxy_prefixes: Vec::new(),
            route_patterns: [
                "/:sitecoreRoute*",
                "/:lang([a-z]{2})/:sitecoreRoute*",
                "/:lang([a-z]{2}-[A-Z]{2})/:sitecoreRoute*",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeout_ms: 60_000,
            disable_x_forward_headers: false,
            disable_change_origin: false,
            reuse_connections: false,
            headers: BTreeMap::new(),
            method: None,
            host_rewrite: None,
            auto_rewrite: false,
            protocol_rewrite: None,
            max_redirects: 21,
            dev_mode: false,
        }
    }
}

impl ProxySettings {
    /// Effective do-not-proxy list (defaults followed by extras).
    pub fn all_do_not_proxy_prefixes(&self) -> Vec<String> {
        self.do_not_proxy_prefixes
            .iter()
            .chain(self.extra_do_not_proxy_prefixes.iter())
            .cloned()
            .collect()
    }

    /// Effective direct-proxy list (defaults followed by extras).
    pub fn all_direct_proxy_prefixes(&self) -> Vec<String> {
        self.direct_proxy_prefixes
            .iter()
            .chain(self.extra_direct_proxy_prefixes.iter())
            .cloned()
            .collect()
    }
}

/// TLS options applied to encrypted upstream targets.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Accept invalid or self-signed upstream certificates.
    pub accept_invalid_certs: bool,

    /// Accept certificates whose hostname does not match.
    pub accept_invalid_hostnames: bool,

    /// Additional trusted root certificate (PEM).
    pub root_certificate_path: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
