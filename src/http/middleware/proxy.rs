//! Layout proxy middleware.
//!
//! # Flow
//! ```text
//! classify ── Skip ──────────────────────────────► next
//!    │
//!    ├─ DirectProxy / Transform
//!    ▼
//! resolve options → invoke upstream → handle response
//!    │
//!    ├─ chainable layout data ─► attach to request ─► next ─► merge head
//!    ├─ non-chainable layout data ─► end with payload
//!    └─ redirected / streamed / answered by hook ─► end
//! ```
//!
//! Errors before the response head is produced are returned through the
//! middleware's `Result`; body errors after that point are only logged.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde_json::Value;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::hooks::{dev_cookie_rewrite, ProxyHooks};
use crate::http::request::{ProxyDefaults, ProxyOptions, ProxyRequestContext};
use crate::http::response::{HandledResponse, ProxiedResponseHead};
use crate::observability::metrics;
use crate::routing::router::PatternError;
use crate::routing::{Classification, RouteClassifier, SkipReason};
use crate::upstream::client::{TlsOptions, TlsSetupError, UpstreamClient};
use crate::upstream::{invoke, InvokeOutcome};

/// Layout service payload handed to the next stage of a chainable request.
#[derive(Debug, Clone)]
pub struct LayoutServiceData {
    /// Parsed payload; `None` when the upstream body was not JSON.
    pub data: Option<Value>,
    /// Status and headers of the upstream response.
    pub head: ProxiedResponseHead,
}

/// Errors building the middleware state at startup.
#[derive(Debug, thiserror::Error)]
pub enum ProxySetupError {
    #[error(transparent)]
    Routes(#[from] PatternError),

    #[error("failed to read root certificate: {0}")]
    RootCertificate(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] TlsSetupError),

    #[error(transparent)]
    Settings(#[from] ProxyError),
}

/// Shared, read-only state of the proxy middleware.
#[derive(Clone, Debug)]
pub struct ProxyState {
    classifier: Arc<RouteClassifier>,
    defaults: Arc<ProxyDefaults>,
    client: UpstreamClient,
}

impl ProxyState {
    /// Build the state from configuration and caller hooks.
    ///
    /// In `dev_mode` the development cookie rewrite is installed unless a
    /// cookie hook was supplied.
    pub fn from_config(config: &ProxyConfig, mut hooks: ProxyHooks) -> std::result::Result<Self, ProxySetupError> {
        if config.proxy.dev_mode && hooks.modify_cookies.is_none() {
            hooks.modify_cookies = Some(dev_cookie_rewrite());
        }

        let classifier = RouteClassifier::from_config(config)?;
        let tls = TlsOptions::from_config(&config.tls)?;
        let client = UpstreamClient::new(tls.clone())?;
        let defaults = ProxyDefaults::from_settings(&config.proxy, tls, hooks)?;

        Ok(Self {
            classifier: Arc::new(classifier),
            defaults: Arc::new(defaults),
            client,
        })
    }

    pub fn classifier(&self) -> &RouteClassifier {
        &self.classifier
    }
}

/// Proxy eligible requests to the layout service, pass the rest through.
pub async fn layout_proxy(
    State(state): State<ProxyState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    let start = Instant::now();
    let classification = state.classifier.classify(request.method(), request.uri())?;
    let mode = classification.mode();

    let (target, is_layout_service_proxy, is_chainable) = match classification {
        Classification::Skip(reason) => {
            match &reason {
                SkipReason::Method(method) => {
                    tracing::debug!(method = %method, path = %request.uri().path(), "Method not proxied")
                }
                SkipReason::DoNotProxy(prefix) => {
                    tracing::debug!(prefix = %prefix, path = %request.uri().path(), "Path excluded from proxy")
                }
            }
            let response = next.run(request).await;
            metrics::record_request(mode, response.status().as_u16(), start);
            return Ok(response);
        }
        Classification::DirectProxy {
            target,
            is_layout_service,
        } => {
            tracing::info!(
                url = %request.uri(),
                upstream = %target,
                layout_service = is_layout_service,
                "Directly proxying request"
            );
            (target, is_layout_service, false)
        }
        Classification::Transform { target, route } => {
            tracing::info!(
                url = %request.uri(),
                route = %route.sitecore_route,
                language = route.language.as_deref().unwrap_or(""),
                upstream = %target,
                "Request converted and proxied to layout service"
            );
            (target, true, true)
        }
    };

    let (parts, body) = request.into_parts();
    let ctx = ProxyRequestContext::from_parts(&parts);
    let options = ProxyOptions::resolve(
        &state.defaults,
        &ctx.method,
        target,
        is_layout_service_proxy,
        is_chainable,
    );

    let outcome = match invoke(&ctx, body, &options, &state.client).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(
                request_id = ctx.request_id.as_deref().unwrap_or(""),
                url = %ctx.url(),
                kind = e.kind(),
                "Proxying failed"
            );
            metrics::record_request(mode, e.status_code().as_u16(), start);
            return Err(e);
        }
    };

    let response = match outcome {
        InvokeOutcome::AlreadyResponded(response) => response,
        InvokeOutcome::Handled(HandledResponse::Intercepted(intercepted)) if options.is_chainable => {
            let head = intercepted.head;
            let mut request = Request::from_parts(parts, Body::empty());
            request.extensions_mut().insert(LayoutServiceData {
                data: intercepted.data,
                head: head.clone(),
            });
            let mut response = next.run(request).await;
            head.merge_into(&mut response);
            response
        }
        InvokeOutcome::Handled(HandledResponse::Intercepted(intercepted)) => intercepted.into_response(),
        InvokeOutcome::Handled(HandledResponse::Redirected(response))
        | InvokeOutcome::Handled(HandledResponse::Streamed(response)) => response,
    };

    metrics::record_request(mode, response.status().as_u16(), start);
    Ok(response)
}
