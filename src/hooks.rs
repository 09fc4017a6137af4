//! Caller-supplied hooks around the proxy pipeline.
//!
//! Hooks take their input by value and hand back a replacement (or an explicit
//! directive) instead of mutating shared state:
//!
//! - `on_proxy_req` runs after the outgoing request is built and before it is
//!   dispatched; it returns the options to send, or answers the request itself.
//! - `modify_cookies` maps the parsed upstream `set-cookie` records.
//! - `modify_layout_service_data` maps the parsed layout service payload.
//! - `handle_proxy_redirect` takes over 301/302 responses and owns the reply.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Response;
use serde_json::Value;

use crate::error::Result;
use crate::http::cookies::SetCookie;
use crate::http::request::{OutgoingRequestOptions, ProxyRequestContext};

/// Maps parsed upstream cookies before they are re-serialized.
pub type CookieHook = Arc<dyn Fn(Vec<SetCookie>) -> Vec<SetCookie> + Send + Sync>;

/// Maps the parsed layout service payload (`None` when the body was not JSON).
pub type LayoutDataHook =
    Arc<dyn Fn(Option<Value>, &ProxyRequestContext) -> Option<Value> + Send + Sync>;

/// What to do after `on_proxy_req` ran.
#[derive(Debug)]
pub enum ProxyReqDirective {
    /// Dispatch the (possibly changed) outgoing request.
    Continue(OutgoingRequestOptions),
    /// The hook answered the request; nothing is sent upstream.
    Respond(Response<Body>),
}

/// Runs before the outgoing request is dispatched.
#[async_trait]
pub trait ProxyReqHook: Send + Sync {
    async fn on_proxy_req(
        &self,
        ctx: &ProxyRequestContext,
        outgoing: OutgoingRequestOptions,
    ) -> Result<ProxyReqDirective>;
}

/// Takes over upstream 301/302 responses.
///
/// `upstream` carries the rewritten head and the untouched upstream body; the
/// returned response is sent as-is.
#[async_trait]
pub trait RedirectHandler: Send + Sync {
    async fn handle_redirect(
        &self,
        ctx: &ProxyRequestContext,
        upstream: Response<Body>,
    ) -> Result<Response<Body>>;
}

/// The set of optional hooks a proxy runs with.
#[derive(Clone, Default)]
pub struct ProxyHooks {
    pub on_proxy_req: Option<Arc<dyn ProxyReqHook>>,
    pub modify_cookies: Option<CookieHook>,
    pub modify_layout_service_data: Option<LayoutDataHook>,
    pub handle_proxy_redirect: Option<Arc<dyn RedirectHandler>>,
}

impl ProxyHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_proxy_req(mut self, hook: impl ProxyReqHook + 'static) -> Self {
        self.on_proxy_req = Some(Arc::new(hook));
        self
    }

    pub fn with_modify_cookies<F>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<SetCookie>) -> Vec<SetCookie> + Send + Sync + 'static,
    {
        self.modify_cookies = Some(Arc::new(hook));
        self
    }

    pub fn with_modify_layout_service_data<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<Value>, &ProxyRequestContext) -> Option<Value> + Send + Sync + 'static,
    {
        self.modify_layout_service_data = Some(Arc::new(hook));
        self
    }

    pub fn with_redirect_handler(mut self, handler: impl RedirectHandler + 'static) -> Self {
        self.handle_proxy_redirect = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for ProxyHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHooks")
            .field("on_proxy_req", &self.on_proxy_req.is_some())
            .field("modify_cookies", &self.modify_cookies.is_some())
            .field("modify_layout_service_data", &self.modify_layout_service_data.is_some())
            .field("handle_proxy_redirect", &self.handle_proxy_redirect.is_some())
            .finish()
    }
}

/// Auth cookie issued with `Secure` by the upstream.
pub const AUTH_COOKIE: &str = ".AspNet.Cookies";

/// Development cookie rewrite: local origins are plain HTTP, so the auth
/// cookie would never be stored while it carries `Secure`.
pub fn dev_cookie_rewrite() -> CookieHook {
    Arc::new(|mut cookies: Vec<SetCookie>| {
        for cookie in cookies.iter_mut().filter(|c| c.name == AUTH_COOKIE) {
            cookie.set_secure(false);
        }
        cookies
    })
}
