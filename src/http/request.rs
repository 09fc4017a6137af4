//! Request context and outgoing request construction.
//!
//! # Responsibilities
//! - Capture the immutable per-request context (method, target, headers, peer)
//! - Resolve per-request proxy options from the shared settings
//! - Derive the outgoing request (port, headers, forwarding metadata, path)
//!
//! # Design Decisions
//! - Incoming headers are cloned, never mutated in place
//! - Caller header overrides apply after x-forwarded-*, before the host rewrite
//! - Outgoing path is the target path + query as resolved, no re-encoding
//! - The incoming body is not part of the context; it moves into the invoker

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::uri::Scheme;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version};
use url::Url;

use crate::config::ProxySettings;
use crate::error::{ProxyError, Result};
use crate::hooks::ProxyHooks;
use crate::upstream::client::{is_secure_scheme, TlsOptions, Transport};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Request extension marking a request that arrived over TLS.
///
/// Inserted by whatever terminates TLS in front of the middleware; the bundled
/// server listens in plain HTTP and never sets it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsConnection;

/// Read-only view of the incoming request, shared by every pipeline stage.
#[derive(Debug, Clone)]
pub struct ProxyRequestContext {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub encrypted: bool,
    pub request_id: Option<String>,
}

impl ProxyRequestContext {
    pub fn from_parts(parts: &Parts) -> Self {
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let request_id = parts
            .headers
            .get(crate::http::X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
            remote_addr,
            // Server-side URIs are origin-form, so the scheme only shows up
            // for absolute-form requests.
            encrypted: parts.extensions.get::<TlsConnection>().is_some()
                || parts.uri.scheme() == Some(&Scheme::HTTPS),
            request_id,
        }
    }

    /// Path and query as received.
    pub fn url(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri.path())
    }
}

/// How incoming headers are forwarded.
#[derive(Debug, Clone, Default)]
pub struct ForwardingPolicy {
    pub disable_x_forward_headers: bool,
    pub disable_change_origin: bool,
    /// Keep upstream connections alive instead of forcing `connection: close`.
    pub reuse_connections: bool,
    /// Applied after the incoming headers; highest precedence.
    pub headers: HeaderMap,
    pub method: Option<Method>,
}

/// How redirect `location` headers pointing at the target are rewritten.
#[derive(Debug, Clone, Default)]
pub struct RedirectRewrite {
    pub host_rewrite: Option<String>,
    pub auto_rewrite: bool,
    pub protocol_rewrite: Option<String>,
}

impl RedirectRewrite {
    pub fn is_enabled(&self) -> bool {
        self.host_rewrite.is_some() || self.auto_rewrite || self.protocol_rewrite.is_some()
    }
}

/// Settings shared by every request, compiled once from configuration.
#[derive(Debug, Clone)]
pub struct ProxyDefaults {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub forwarding: ForwardingPolicy,
    pub rewrite: RedirectRewrite,
    pub tls: TlsOptions,
    pub hooks: ProxyHooks,
}

impl ProxyDefaults {
    pub fn from_settings(settings: &ProxySettings, tls: TlsOptions, hooks: ProxyHooks) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid_header(name, e))?;
            let value = HeaderValue::from_str(value).map_err(|e| invalid_header(name.as_str(), e))?;
            headers.insert(name, value);
        }
        let method = settings
            .method
            .as_deref()
            .map(|m| Method::from_bytes(m.as_bytes()).map_err(|e| invalid_header("method", e)))
            .transpose()?;

        Ok(Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            max_redirects: settings.max_redirects,
            forwarding: ForwardingPolicy {
                disable_x_forward_headers: settings.disable_x_forward_headers,
                disable_change_origin: settings.disable_change_origin,
                reuse_connections: settings.reuse_connections,
                headers,
                method,
            },
            rewrite: RedirectRewrite {
                host_rewrite: settings.host_rewrite.clone(),
                auto_rewrite: settings.auto_rewrite,
                protocol_rewrite: settings.protocol_rewrite.clone(),
            },
            tls,
            hooks,
        })
    }
}

impl Default for ProxyDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(60_000),
            max_redirects: 21,
            forwarding: ForwardingPolicy::default(),
            rewrite: RedirectRewrite::default(),
            tls: TlsOptions::default(),
            hooks: ProxyHooks::default(),
        }
    }
}

fn invalid_header(name: &str, e: impl std::fmt::Display) -> ProxyError {
    ProxyError::InvalidTarget {
        target: name.to_string(),
        reason: e.to_string(),
    }
}

/// Options resolved for one proxied request.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Absolute upstream URL.
    pub target: Url,
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub forwarding: ForwardingPolicy,
    pub rewrite: RedirectRewrite,
    pub tls: TlsOptions,
    pub hooks: ProxyHooks,
    /// Buffer, decode and parse the response instead of streaming it.
    pub is_layout_service_proxy: bool,
    /// Continue to downstream middleware after the proxy stage.
    pub is_chainable: bool,
}

impl ProxyOptions {
    /// Resolve options for `method` against `target`.
    ///
    /// POST requests never follow redirects so cookies set by the first
    /// response are kept.
    pub fn resolve(
        defaults: &ProxyDefaults,
        method: &Method,
        target: Url,
        is_layout_service_proxy: bool,
        is_chainable: bool,
    ) -> Self {
        Self {
            target,
            timeout: defaults.timeout,
            follow_redirects: method != Method::POST,
            max_redirects: defaults.max_redirects,
            forwarding: defaults.forwarding.clone(),
            rewrite: defaults.rewrite.clone(),
            tls: defaults.tls.clone(),
            hooks: defaults.hooks.clone(),
            is_layout_service_proxy,
            is_chainable,
        }
    }

    pub fn transport(&self) -> Transport {
        Transport::for_scheme(self.target.scheme())
    }
}

/// The request sent upstream.
#[derive(Debug, Clone)]
pub struct OutgoingRequestOptions {
    pub secure: bool,
    /// Host as written in the target URL (includes a non-default port).
    pub host: String,
    pub hostname: String,
    pub port: u16,
    /// Path plus query string.
    pub path: String,
    pub method: Method,
    pub headers: HeaderMap,
    /// Extra TLS options, present for encrypted targets only.
    pub tls: Option<TlsOptions>,
}

impl OutgoingRequestOptions {
    pub fn transport(&self) -> Transport {
        if self.secure {
            Transport::Tls
        } else {
            Transport::Plain
        }
    }

    /// Absolute URI used on the wire.
    pub fn uri(&self) -> Result<Uri> {
        let scheme = if self.secure { "https" } else { "http" };
        let raw = format!("{}://{}:{}{}", scheme, self.hostname, self.port, self.path);
        raw.parse::<Uri>().map_err(|e| ProxyError::InvalidTarget {
            target: raw.clone(),
            reason: e.to_string(),
        })
    }

    /// Absolute URL, for redirect resolution and logging.
    pub fn url(&self) -> Result<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        let raw = format!("{}://{}{}", scheme, self.host, self.path);
        Url::parse(&raw).map_err(|e| ProxyError::InvalidTarget {
            target: raw.clone(),
            reason: e.to_string(),
        })
    }

    /// Assemble the request with `body`.
    pub fn to_request(&self, body: Body) -> Result<Request<Body>> {
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(self.uri()?)
            .body(body)
            .map_err(|e| ProxyError::InvalidTarget {
                target: self.path.clone(),
                reason: e.to_string(),
            })?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }

    /// Point the request at another URL, keeping method and headers.
    pub fn retarget(&self, target: &Url) -> Result<Self> {
        let mut next = self.clone();
        let (secure, host, hostname, port) = target_parts(target)?;
        next.secure = secure;
        next.host = host;
        next.hostname = hostname;
        next.port = port;
        next.path = target_path(target);
        if next.headers.contains_key(header::HOST) {
            let value = host_header(&next.host, next.port);
            next.headers.insert(
                header::HOST,
                HeaderValue::from_str(&value).map_err(|e| invalid_header("host", e))?,
            );
        }
        Ok(next)
    }
}

fn target_parts(target: &Url) -> Result<(bool, String, String, u16)> {
    let secure = is_secure_scheme(target.scheme());
    let hostname = target
        .host_str()
        .ok_or_else(|| ProxyError::InvalidTarget {
            target: target.to_string(),
            reason: "missing host".into(),
        })?
        .to_string();
    let port = target.port().unwrap_or(if secure { 443 } else { 80 });
    let host = match target.port() {
        Some(explicit) => format!("{}:{}", hostname, explicit),
        None => hostname.clone(),
    };
    Ok((secure, host, hostname, port))
}

fn target_path(target: &Url) -> String {
    match target.query() {
        Some(query) => format!("{}?{}", target.path(), query),
        None => target.path().to_string(),
    }
}

/// `host:port`, unless `host` already carries a port.
fn host_header(host: &str, port: u16) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

fn is_upgrade(connection: &HeaderValue) -> bool {
    connection
        .to_str()
        .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false)
}

fn append_forwarded(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    let existing: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let combined = if existing.is_empty() {
        value.to_string()
    } else {
        format!("{},{}", existing.join(","), value)
    };
    let combined = HeaderValue::from_str(&combined).map_err(|e| invalid_header(name, e))?;
    headers.insert(name, combined);
    Ok(())
}

/// Derive the outgoing request from the incoming context and resolved options.
pub fn build_outgoing(ctx: &ProxyRequestContext, options: &ProxyOptions) -> Result<OutgoingRequestOptions> {
    let (secure, host, hostname, port) = target_parts(&options.target)?;
    let policy = &options.forwarding;

    let mut headers = ctx.headers.clone();

    if !policy.disable_x_forward_headers {
        if let Some(addr) = ctx.remote_addr {
            append_forwarded(&mut headers, X_FORWARDED_FOR, &addr.ip().to_string())?;
        }
        let proto = if ctx.encrypted { "https" } else { "http" };
        append_forwarded(&mut headers, X_FORWARDED_PROTO, proto)?;
    }

    for (name, value) in &policy.headers {
        headers.insert(name.clone(), value.clone());
    }

    if !policy.disable_change_origin {
        let value = host_header(&host, port);
        headers.insert(
            header::HOST,
            HeaderValue::from_str(&value).map_err(|e| invalid_header("host", e))?,
        );
    }

    if !policy.reuse_connections {
        let upgrading = headers.get(header::CONNECTION).map(is_upgrade).unwrap_or(false);
        if !upgrading {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
    }

    Ok(OutgoingRequestOptions {
        secure,
        host,
        hostname,
        port,
        path: target_path(&options.target),
        method: policy.method.clone().unwrap_or_else(|| ctx.method.clone()),
        headers,
        tls: secure.then(|| options.tls.clone()),
    })
}
