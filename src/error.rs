//! Error taxonomy for the proxy pipeline.
//!
//! # Design Decisions
//! - Classification skips are not errors; they never reach this type
//! - Malformed layout service bodies are recovered locally (null payload)
//! - Every variant maps to exactly one HTTP status for the middleware error path

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors raised while building, invoking, or handling a proxied request.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Socket-level failure talking to the upstream host.
    #[error("upstream connection error for {target}: {message}")]
    UpstreamConnection { target: String, message: String },

    /// The upstream did not answer within the configured deadline.
    #[error("upstream request to {target} timed out after {timeout:?}")]
    UpstreamTimeout { target: String, timeout: Duration },

    /// The incoming connection went away before the exchange completed.
    #[error("incoming request aborted: {url}")]
    ClientAbort { url: String },

    /// The resolved target could not be turned into a request.
    #[error("invalid proxy target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    /// The buffered layout service body could not be decompressed.
    #[error("failed to decode upstream body ({encoding}): {source}")]
    Decode {
        encoding: String,
        #[source]
        source: std::io::Error,
    },

    /// A caller-supplied hook refused the request.
    #[error("proxy hook failed: {0}")]
    Hook(String),

    /// Redirect chain exceeded the configured limit.
    #[error("maximum number of redirects ({max}) exceeded for {target}")]
    TooManyRedirects { target: String, max: usize },

    /// The outgoing response could not be assembled.
    #[error("failed to build response: {0}")]
    Response(String),
}

impl ProxyError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::UpstreamConnection { .. } => "upstream_connection",
            ProxyError::UpstreamTimeout { .. } => "upstream_timeout",
            ProxyError::ClientAbort { .. } => "client_abort",
            ProxyError::InvalidTarget { .. } => "invalid_target",
            ProxyError::Decode { .. } => "decode",
            ProxyError::Hook(_) => "hook",
            ProxyError::TooManyRedirects { .. } => "too_many_redirects",
            ProxyError::Response(_) => "response",
        }
    }

    /// Status code reported to the client when this error ends the exchange.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamConnection { .. }
            | ProxyError::ClientAbort { .. }
            | ProxyError::TooManyRedirects { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidTarget { .. }
            | ProxyError::Decode { .. }
            | ProxyError::Hook(_)
            | ProxyError::Response(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::error!(kind = self.kind(), error = %self, "Proxy request failed");
        (status, status.canonical_reason().unwrap_or("Proxy error")).into_response()
    }
}

/// Result alias used across the proxy pipeline.
pub type Result<T> = std::result::Result<T, ProxyError>;
