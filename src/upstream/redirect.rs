//! Redirect-following transport wrapper.
//!
//! # Responsibilities
//! - Re-issue the request for 301/302/303/307/308 responses with a location
//! - Switch to GET where browsers do (303, and 301/302 after POST)
//! - Drop credentials when the redirect leaves the original host
//!
//! # Design Decisions
//! - The streamed request body is sent on the first hop only; later hops are
//!   bodiless, so only body-less methods are followed in practice
//! - Intermediate responses (and their cookies) are discarded

use axum::body::Body;
use axum::http::{header, Method, Response, StatusCode};
use hyper::body::Incoming;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::http::request::OutgoingRequestOptions;
use crate::upstream::client::UpstreamClient;

/// Maps a transport failure into the pipeline's error type.
pub type SendErrorMapper<'a> = &'a (dyn Fn(hyper_util::client::legacy::Error) -> ProxyError + Send + Sync);

fn is_followable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Wraps an upstream client, following redirects up to a limit.
#[derive(Debug)]
pub struct FollowRedirects<'a> {
    client: &'a UpstreamClient,
    max_redirects: usize,
}

impl<'a> FollowRedirects<'a> {
    pub fn new(client: &'a UpstreamClient, max_redirects: usize) -> Self {
        Self {
            client,
            max_redirects,
        }
    }

    /// Send `outgoing` with `body`, then follow any redirect chain.
    pub async fn send(
        &self,
        outgoing: OutgoingRequestOptions,
        body: Body,
        map_err: SendErrorMapper<'_>,
    ) -> Result<Response<Incoming>> {
        let mut current = outgoing;
        let mut response = self
            .client
            .send(current.transport(), current.tls.as_ref(), current.to_request(body)?)
            .await
            .map_err(map_err)?;

        let mut hops = 0;
        loop {
            let status = response.status();
            if !is_followable(status) {
                return Ok(response);
            }
            let Some(location) = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                return Ok(response);
            };

            let current_url = current.url()?;
            let next_url = current_url.join(location).map_err(|e| ProxyError::InvalidTarget {
                target: location.to_string(),
                reason: e.to_string(),
            })?;

            if hops == self.max_redirects {
                return Err(ProxyError::TooManyRedirects {
                    target: current_url.to_string(),
                    max: self.max_redirects,
                });
            }
            hops += 1;

            current = next_hop(&current, &current_url, &next_url, status)?;
            tracing::debug!(
                hop = hops,
                status = %status,
                location = %next_url,
                "Following upstream redirect"
            );
            response = self
                .client
                .send(current.transport(), current.tls.as_ref(), current.to_request(Body::empty())?)
                .await
                .map_err(map_err)?;
        }
    }
}

fn next_hop(
    current: &OutgoingRequestOptions,
    current_url: &Url,
    next_url: &Url,
    status: StatusCode,
) -> Result<OutgoingRequestOptions> {
    let mut next = current.retarget(next_url)?;

    let to_get = (status == StatusCode::SEE_OTHER && next.method != Method::HEAD)
        || ((status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND)
            && next.method == Method::POST);
    if to_get {
        next.method = Method::GET;
        next.headers.remove(header::CONTENT_TYPE);
    }
    // Later hops never carry a body.
    next.headers.remove(header::CONTENT_LENGTH);
    next.headers.remove(header::TRANSFER_ENCODING);

    if current_url.host_str() != next_url.host_str() {
        next.headers.remove(header::AUTHORIZATION);
        next.headers.remove(header::COOKIE);
    }
    Ok(next)
}
