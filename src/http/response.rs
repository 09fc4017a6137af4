//! Upstream response handling.
//!
//! # Responsibilities
//! - Fix framing headers for the client's HTTP version
//! - Rewrite redirect locations that point back at the target
//! - Copy upstream headers, rewriting `set-cookie`
//! - Strip origin fingerprinting headers (`server`, `x-powered-by`)
//! - Intercept layout service bodies, hand redirects to the redirect hook,
//!   or stream everything else straight through
//!
//! # Design Decisions
//! - Steps run in a fixed order; each may be skipped on its own condition
//! - Only layout service responses are buffered; no size cap is applied
//! - A body that is not JSON yields a `None` payload, never an error
//! - Errors while streaming a body happen after the head is flushed and are
//!   only logged
//! - Passed-through bodies carry the request timeout as an idle deadline that
//!   resets on every frame; expiry drops the upstream body and aborts the
//!   client response

use std::io::Read;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode, Version};
use axum::BoxError;
use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use serde_json::Value;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::http::cookies::rewrite_set_cookies;
use crate::http::request::{ProxyOptions, ProxyRequestContext, RedirectRewrite};
use crate::observability::metrics;

const REWRITABLE_REDIRECTS: [StatusCode; 4] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

const X_POWERED_BY: &str = "x-powered-by";

/// Status and headers prepared for the client.
#[derive(Clone)]
pub struct ProxiedResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Upstream reason phrase, kept only when it is not the canonical one.
    pub reason: Option<ReasonPhrase>,
}

impl std::fmt::Debug for ProxiedResponseHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxiedResponseHead")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("reason", &self.reason.as_ref().map(|r| String::from_utf8_lossy(r.as_bytes())))
            .finish()
    }
}

impl ProxiedResponseHead {
    /// Attach `body` to this head.
    pub fn into_response(self, body: Body) -> Response<Body> {
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        if let Some(reason) = self.reason {
            response.extensions_mut().insert(reason);
        }
        response
    }

    /// Carry this head over onto a response produced further down the chain.
    ///
    /// Cookies are appended; other headers fill in only what the downstream
    /// response left unset. Body framing headers are never copied. The
    /// upstream status applies unless the downstream stage chose one other
    /// than `200 OK`.
    pub fn merge_into(&self, response: &mut Response<Body>) {
        if response.status() == StatusCode::OK && self.status != StatusCode::OK {
            *response.status_mut() = self.status;
            if let Some(reason) = &self.reason {
                response.extensions_mut().insert(reason.clone());
            }
        }
        for name in self.headers.keys() {
            if *name == header::CONTENT_LENGTH
                || *name == header::TRANSFER_ENCODING
                || *name == header::CONTENT_ENCODING
            {
                continue;
            }
            if *name == header::SET_COOKIE {
                for value in self.headers.get_all(name) {
                    response.headers_mut().append(header::SET_COOKIE, value.clone());
                }
            } else if !response.headers().contains_key(name) {
                for value in self.headers.get_all(name) {
                    response.headers_mut().append(name.clone(), value.clone());
                }
            }
        }
    }
}

/// A buffered layout service response.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub head: ProxiedResponseHead,
    /// Parsed (and hook-modified) payload; `None` when the body was not JSON.
    pub data: Option<Value>,
    /// The decoded body bytes as received.
    pub raw_body: Bytes,
}

impl InterceptedResponse {
    /// End the exchange with the payload re-serialized, or the decoded bytes
    /// unchanged when the body did not parse.
    pub fn into_response(self) -> Response<Body> {
        let body = match &self.data {
            Some(data) => match serde_json::to_vec(data) {
                Ok(bytes) => Bytes::from(bytes),
                Err(_) => self.raw_body.clone(),
            },
            None => self.raw_body.clone(),
        };
        let mut head = self.head;
        head.headers.remove(header::TRANSFER_ENCODING);
        head.headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        head.into_response(Body::from(body))
    }
}

/// What the handler did with the upstream response.
#[derive(Debug)]
pub enum HandledResponse {
    /// Layout service data was buffered; nothing has been sent yet.
    Intercepted(InterceptedResponse),
    /// The redirect hook produced the reply.
    Redirected(Response<Body>),
    /// The upstream body is piped to the client unbuffered.
    Streamed(Response<Body>),
}

/// Process an upstream response according to `options`.
pub async fn handle_response(
    ctx: &ProxyRequestContext,
    upstream: Response<Incoming>,
    options: &ProxyOptions,
) -> Result<HandledResponse> {
    let (mut parts, body) = upstream.into_parts();
    let headers = &mut parts.headers;

    remove_chunked(ctx, headers);
    set_connection(ctx, headers);
    rewrite_redirect_location(ctx, parts.status, headers, options);

    let mut out_headers = copy_headers(std::mem::take(headers), options);
    out_headers.remove(header::SERVER);
    out_headers.remove(X_POWERED_BY);

    let mut head = ProxiedResponseHead {
        status: parts.status,
        headers: out_headers,
        reason: parts.extensions.remove::<ReasonPhrase>(),
    };

    if options.is_layout_service_proxy {
        let raw = body
            .collect()
            .await
            .map_err(|e| ProxyError::UpstreamConnection {
                target: options.target.to_string(),
                message: e.to_string(),
            })?
            .to_bytes();

        let encoding = head
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let decoded = decode_body(raw, encoding.as_deref())?;

        let mut data = parse_layout_data(&decoded, ctx);
        if let Some(hook) = &options.hooks.modify_layout_service_data {
            data = hook(data, ctx);
        }

        head.headers.remove(header::CONTENT_ENCODING);
        return Ok(HandledResponse::Intercepted(InterceptedResponse {
            head,
            data,
            raw_body: decoded,
        }));
    }

    if let Some(handler) = &options.hooks.handle_proxy_redirect {
        if head.status == StatusCode::MOVED_PERMANENTLY || head.status == StatusCode::FOUND {
            tracing::debug!(status = %head.status, "Delegating upstream redirect");
            let body = with_idle_timeout(body, options.timeout, options.target.to_string());
            let response = head.into_response(body);
            return handler.handle_redirect(ctx, response).await.map(HandledResponse::Redirected);
        }
    }

    let target = options.target.to_string();
    let body = body.map_err(move |e| {
        tracing::warn!(upstream = %target, error = %e, "Upstream body failed after response head was sent");
        e
    });
    let body = with_idle_timeout(body, options.timeout, options.target.to_string());
    Ok(HandledResponse::Streamed(head.into_response(body)))
}

/// Fail `body` when no frame arrives within `idle`.
///
/// The wrapped body is dropped on expiry, which closes the upstream connection.
fn with_idle_timeout<B>(body: B, idle: Duration, target: String) -> Body
where
    B: http_body::Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    let frames = futures_util::stream::unfold(Some(body), move |state| {
        let target = target.clone();
        async move {
            let mut body = state?;
            match tokio::time::timeout(idle, body.frame()).await {
                Ok(Some(Ok(frame))) => Some((Ok(frame), Some(body))),
                Ok(Some(Err(e))) => Some((Err(e.into()), None)),
                Ok(None) => None,
                Err(_) => {
                    tracing::warn!(upstream = %target, timeout = ?idle, "Upstream body stalled; response aborted");
                    metrics::record_upstream_error("upstream_timeout");
                    let err: BoxError = Box::new(ProxyError::UpstreamTimeout { target, timeout: idle });
                    Some((Err(err), None))
                }
            }
        }
    });
    Body::new(StreamBody::new(frames))
}

/// Chunked transfer encoding does not exist in HTTP/1.0.
fn remove_chunked(ctx: &ProxyRequestContext, headers: &mut HeaderMap) {
    if ctx.version == Version::HTTP_10 {
        headers.remove(header::TRANSFER_ENCODING);
    }
}

fn set_connection(ctx: &ProxyRequestContext, headers: &mut HeaderMap) {
    let incoming = ctx.headers.get(header::CONNECTION).cloned();
    if ctx.version == Version::HTTP_10 {
        headers.insert(
            header::CONNECTION,
            incoming.unwrap_or_else(|| HeaderValue::from_static("close")),
        );
    } else if ctx.version != Version::HTTP_2 && !headers.contains_key(header::CONNECTION) {
        headers.insert(
            header::CONNECTION,
            incoming.unwrap_or_else(|| HeaderValue::from_static("keep-alive")),
        );
    }
}

fn rewrite_redirect_location(
    ctx: &ProxyRequestContext,
    status: StatusCode,
    headers: &mut HeaderMap,
    options: &ProxyOptions,
) {
    let policy = &options.rewrite;
    if !policy.is_enabled() || !REWRITABLE_REDIRECTS.contains(&status) {
        return;
    }
    let Some(location) = headers.get(header::LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let Ok(location) = Url::parse(location) else {
        return;
    };

    let incoming_host = ctx.headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if let Some(rewritten) = rewrite_location(location, &options.target, policy, incoming_host) {
        match HeaderValue::from_str(rewritten.as_str()) {
            Ok(value) => {
                headers.insert(header::LOCATION, value);
            }
            Err(e) => tracing::warn!(error = %e, "Rewritten redirect location is not a valid header"),
        }
    }
}

/// `host[:port]` of a URL, the way it appears in an authority.
fn url_host(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Rewrite `location` when it points at `target`'s host.
fn rewrite_location(
    mut location: Url,
    target: &Url,
    policy: &RedirectRewrite,
    incoming_host: Option<&str>,
) -> Option<Url> {
    if url_host(&location) != url_host(target) {
        return None;
    }

    let new_host = policy
        .host_rewrite
        .as_deref()
        .or(if policy.auto_rewrite { incoming_host } else { None });
    if let Some(new_host) = new_host {
        let (host, port) = match new_host.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                (host, port.parse::<u16>().ok())
            }
            _ => (new_host, None),
        };
        location.set_host(Some(host)).ok()?;
        location.set_port(port).ok()?;
    }
    if let Some(protocol) = &policy.protocol_rewrite {
        location.set_scheme(protocol.trim_end_matches(':')).ok()?;
    }
    Some(location)
}

/// Copy upstream headers, rewriting cookies on the way.
fn copy_headers(upstream: HeaderMap, options: &ProxyOptions) -> HeaderMap {
    let cookies: Vec<HeaderValue> = upstream.get_all(header::SET_COOKIE).iter().cloned().collect();

    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream.iter() {
        if *name != header::SET_COOKIE {
            out.append(name.clone(), value.clone());
        }
    }
    if !cookies.is_empty() {
        for value in rewrite_set_cookies(cookies, options.hooks.modify_cookies.as_ref()) {
            out.append(header::SET_COOKIE, value);
        }
    }
    out
}

/// Undo `gzip` / `deflate` content encoding.
pub fn decode_body(raw: Bytes, content_encoding: Option<&str>) -> Result<Bytes> {
    let Some(encoding) = content_encoding else {
        return Ok(raw);
    };
    if !(encoding.contains("gzip") || encoding.contains("deflate")) {
        return Ok(raw);
    }

    // Detect the actual container rather than trusting the header.
    let mut decoded = Vec::new();
    let result = if raw.starts_with(&[0x1f, 0x8b]) {
        GzDecoder::new(raw.as_ref()).read_to_end(&mut decoded)
    } else {
        ZlibDecoder::new(raw.as_ref()).read_to_end(&mut decoded)
    };
    result.map_err(|source| ProxyError::Decode {
        encoding: encoding.to_string(),
        source,
    })?;
    Ok(Bytes::from(decoded))
}

/// Parse a layout service body; anything but a JSON object or array is `None`.
fn parse_layout_data(body: &[u8], ctx: &ProxyRequestContext) -> Option<Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        Ok(other) => {
            tracing::warn!(url = %ctx.url(), kind = json_kind(&other), "Layout service body is not a JSON object");
            None
        }
        Err(e) => {
            tracing::warn!(
                url = %ctx.url(),
                error = %e,
                body = %String::from_utf8_lossy(&body[..body.len().min(256)]),
                "Failed to parse layout service body"
            );
            None
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use axum::http::Method;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    fn ctx(version: Version) -> ProxyRequestContext {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("www.example.com"));
        ProxyRequestContext {
            method: Method::GET,
            uri: "/about".parse().unwrap(),
            version,
            headers,
            remote_addr: None,
            encrypted: false,
            request_id: None,
        }
    }

    fn options() -> ProxyOptions {
        ProxyOptions::resolve(
            &Default::default(),
            &Method::GET,
            Url::parse("http://cm.local/about").unwrap(),
            false,
            false,
        )
    }

    #[test]
    fn http10_strips_chunked_and_defaults_to_close() {
        let ctx = ctx(Version::HTTP_10);
        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        remove_chunked(&ctx, &mut headers);
        set_connection(&ctx, &mut headers);
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers[header::CONNECTION], "close");
    }

    #[test]
    fn http11_defaults_to_keep_alive_only_when_absent() {
        let ctx = ctx(Version::HTTP_11);
        let mut headers = HeaderMap::new();
        set_connection(&ctx, &mut headers);
        assert_eq!(headers[header::CONNECTION], "keep-alive");

        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        set_connection(&ctx, &mut headers);
        assert_eq!(headers[header::CONNECTION], "close");

        let mut headers = HeaderMap::new();
        set_connection(&self::ctx(Version::HTTP_2), &mut headers);
        assert!(headers.get(header::CONNECTION).is_none());
    }

    #[test]
    fn location_rewrite_only_for_target_host() {
        let target = Url::parse("http://cm.local/about").unwrap();
        let policy = RedirectRewrite {
            host_rewrite: Some("www.example.com:8443".into()),
            auto_rewrite: false,
            protocol_rewrite: Some("https".into()),
        };

        let rewritten = rewrite_location(
            Url::parse("http://cm.local/login?returnUrl=%2F").unwrap(),
            &target,
            &policy,
            None,
        )
        .unwrap();
        assert_eq!(rewritten.as_str(), "https://www.example.com:8443/login?returnUrl=%2F");

        assert!(rewrite_location(
            Url::parse("http://idp.example.org/login").unwrap(),
            &target,
            &policy,
            None
        )
        .is_none());
    }

    #[test]
    fn auto_rewrite_uses_incoming_host() {
        let target = Url::parse("http://cm.local:8080/").unwrap();
        let policy = RedirectRewrite {
            auto_rewrite: true,
            ..Default::default()
        };
        let rewritten = rewrite_location(
            Url::parse("http://cm.local:8080/en/home").unwrap(),
            &target,
            &policy,
            Some("www.example.com"),
        )
        .unwrap();
        assert_eq!(rewritten.as_str(), "http://www.example.com/en/home");
    }

    #[test]
    fn redirect_header_rewrite_skips_non_redirects() {
        let mut opts = options();
        opts.rewrite.protocol_rewrite = Some("https".into());
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("http://cm.local/x"));

        rewrite_redirect_location(&ctx(Version::HTTP_11), StatusCode::OK, &mut headers, &opts);
        assert_eq!(headers[header::LOCATION], "http://cm.local/x");

        rewrite_redirect_location(&ctx(Version::HTTP_11), StatusCode::FOUND, &mut headers, &opts);
        assert_eq!(headers[header::LOCATION], "https://cm.local/x");
    }

    #[test]
    fn copy_headers_rewrites_cookies() {
        let mut upstream = HeaderMap::new();
        upstream.append(header::SET_COOKIE, HeaderValue::from_static("SC_ANALYTICS_GLOBAL_COOKIE="));
        upstream.append(header::SET_COOKIE, HeaderValue::from_static("a=1; Path=/"));
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let out = copy_headers(upstream, &options());
        let cookies: Vec<&str> = out
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        assert_eq!(cookies, vec!["a=1; Path=/"]);
        assert_eq!(out[header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn decodes_gzip_and_deflate() {
        let json = br#"{"sitecore":{"route":null}}"#;

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(json).unwrap();
        let gz = Bytes::from(gz.finish().unwrap());
        assert_eq!(decode_body(gz, Some("gzip")).unwrap().as_ref(), json);

        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(json).unwrap();
        let zlib = Bytes::from(zlib.finish().unwrap());
        assert_eq!(decode_body(zlib, Some("deflate")).unwrap().as_ref(), json);

        let plain = Bytes::from_static(json);
        assert_eq!(decode_body(plain.clone(), None).unwrap(), plain);
        assert!(decode_body(Bytes::from_static(b"not compressed"), Some("gzip")).is_err());
    }

    #[test]
    fn malformed_json_yields_none() {
        let ctx = ctx(Version::HTTP_11);
        assert!(parse_layout_data(b"<html>", &ctx).is_none());
        assert!(parse_layout_data(b"42", &ctx).is_none());
        assert!(parse_layout_data(br#"{"a":1}"#, &ctx).is_some());
    }

    #[test]
    fn merge_appends_cookies_and_fills_gaps() {
        let mut headers = HeaderMap::new();
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        headers.insert("x-upstream", HeaderValue::from_static("cm"));
        let head = ProxiedResponseHead {
            status: StatusCode::NOT_FOUND,
            headers,
            reason: None,
        };

        let mut response = Response::new(Body::from("<html></html>"));
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        response
            .headers_mut()
            .insert(header::SET_COOKIE, HeaderValue::from_static("b=2"));
        head.merge_into(&mut response);

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
        assert_eq!(response.headers()["x-upstream"], "cm");
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(response.headers().get_all(header::SET_COOKIE).iter().count(), 2);
    }

    #[tokio::test]
    async fn idle_deadline_passes_complete_bodies() {
        let body = with_idle_timeout(
            http_body_util::Full::new(Bytes::from_static(b"abc")),
            Duration::from_millis(50),
            "http://cm.local/".into(),
        );
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"abc");
    }

    #[tokio::test]
    async fn idle_deadline_fails_stalled_bodies() {
        let stalled = StreamBody::new(futures_util::stream::pending::<
            std::result::Result<http_body::Frame<Bytes>, std::io::Error>,
        >());
        let body = with_idle_timeout(stalled, Duration::from_millis(50), "http://cm.local/".into());
        let result = tokio::time::timeout(Duration::from_secs(2), body.collect())
            .await
            .expect("idle deadline never fired");
        assert!(result.is_err());
    }

    #[test]
    fn merge_keeps_status_chosen_downstream() {
        let head = ProxiedResponseHead {
            status: StatusCode::NOT_FOUND,
            headers: HeaderMap::new(),
            reason: None,
        };
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        head.merge_into(&mut response);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn intercepted_response_reserializes_payload() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("2"));
        let intercepted = InterceptedResponse {
            head: ProxiedResponseHead {
                status: StatusCode::OK,
                headers,
                reason: None,
            },
            data: Some(serde_json::json!({"modified": true})),
            raw_body: Bytes::from_static(b"{}"),
        };
        let response = intercepted.into_response();
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "17");
    }
}
