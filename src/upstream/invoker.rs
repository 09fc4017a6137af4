//! Upstream invocation.
//!
//! # Responsibilities
//! - Run the `on_proxy_req` hook on the outgoing request
//! - Stream the incoming body upstream and dispatch the request
//! - Enforce the per-request timeout
//! - Classify transport failures (connection, timeout, client abort)
//! - Hand the upstream response to the response handler
//!
//! # Design Decisions
//! - Cancellation follows ownership: when the client disconnects, the serving
//!   future is dropped, which drops the in-flight upstream request
//! - A failed incoming body stream is remembered so the resulting upstream
//!   error is reported as a client abort

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::Response;
use futures_util::TryStreamExt;
use http_body::Body as _;
use hyper::body::Incoming;

use crate::error::{ProxyError, Result};
use crate::hooks::ProxyReqDirective;
use crate::http::request::{build_outgoing, OutgoingRequestOptions, ProxyOptions, ProxyRequestContext};
use crate::http::response::{handle_response, HandledResponse};
use crate::observability::metrics;
use crate::upstream::client::UpstreamClient;
use crate::upstream::redirect::FollowRedirects;

/// Result of one upstream invocation.
#[derive(Debug)]
pub enum InvokeOutcome {
    /// The upstream answered; see [`HandledResponse`].
    Handled(HandledResponse),
    /// `on_proxy_req` answered the request; nothing was sent upstream.
    AlreadyResponded(Response<Body>),
}

/// Logs and counts an exchange dropped before it finished.
struct InFlight {
    url: String,
    done: bool,
}

impl InFlight {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            done: false,
        }
    }

    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(url = %self.url, "Client aborted request; upstream request cancelled");
            metrics::record_client_abort();
        }
    }
}

/// Dispatch `body` upstream for `ctx` and process the response.
pub async fn invoke(
    ctx: &ProxyRequestContext,
    body: Body,
    options: &ProxyOptions,
    client: &UpstreamClient,
) -> Result<InvokeOutcome> {
    let mut outgoing = build_outgoing(ctx, options)?;

    if let Some(hook) = &options.hooks.on_proxy_req {
        match hook.on_proxy_req(ctx, outgoing).await? {
            ProxyReqDirective::Continue(next) => outgoing = next,
            ProxyReqDirective::Respond(response) => {
                tracing::info!(
                    url = %ctx.url(),
                    status = %response.status(),
                    "Request answered before proxying; upstream request not sent"
                );
                return Ok(InvokeOutcome::AlreadyResponded(response));
            }
        }
    }

    let in_flight = InFlight::new(ctx.url());
    let aborted = Arc::new(AtomicBool::new(false));
    let body = watch_body(body, aborted.clone());

    let target = options.target.to_string();
    let url = ctx.url().to_string();
    let map_err = move |e: hyper_util::client::legacy::Error| send_error(e, &target, &url, &aborted);

    let exchange = async {
        let response = send(outgoing, body, options, client, &map_err).await?;
        handle_response(ctx, response, options).await
    };

    let result = match tokio::time::timeout(options.timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::UpstreamTimeout {
            target: options.target.to_string(),
            timeout: options.timeout,
        }),
    };
    in_flight.finish();

    if let Err(e) = &result {
        match e {
            ProxyError::ClientAbort { .. } => metrics::record_client_abort(),
            other => metrics::record_upstream_error(other.kind()),
        }
    }
    result.map(InvokeOutcome::Handled)
}

async fn send(
    outgoing: OutgoingRequestOptions,
    body: Body,
    options: &ProxyOptions,
    client: &UpstreamClient,
    map_err: &(dyn Fn(hyper_util::client::legacy::Error) -> ProxyError + Send + Sync),
) -> Result<Response<Incoming>> {
    tracing::debug!(
        method = %outgoing.method,
        upstream = %options.target,
        follow_redirects = options.follow_redirects,
        "Dispatching upstream request"
    );
    if options.follow_redirects {
        FollowRedirects::new(client, options.max_redirects)
            .send(outgoing, body, map_err)
            .await
    } else {
        client
            .send(outgoing.transport(), outgoing.tls.as_ref(), outgoing.to_request(body)?)
            .await
            .map_err(map_err)
    }
}

/// Pass the incoming body through, flagging `aborted` if it fails midway.
fn watch_body(body: Body, aborted: Arc<AtomicBool>) -> Body {
    if body.is_end_stream() {
        return Body::empty();
    }
    Body::from_stream(body.into_data_stream().inspect_err(move |e| {
        tracing::debug!(error = %e, "Incoming request body failed");
        aborted.store(true, Ordering::SeqCst);
    }))
}

fn send_error(
    e: hyper_util::client::legacy::Error,
    target: &str,
    url: &str,
    aborted: &AtomicBool,
) -> ProxyError {
    if aborted.load(Ordering::SeqCst) {
        return ProxyError::ClientAbort { url: url.to_string() };
    }
    ProxyError::UpstreamConnection {
        target: target.to_string(),
        message: error_chain(&e),
    }
}

/// `error: cause: cause` for an error and its sources.
fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
