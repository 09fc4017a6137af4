//! Caller hooks around the proxy pipeline.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode};
use serde_json::{json, Value};

use layout_proxy::error::Result;
use layout_proxy::hooks::{ProxyHooks, ProxyReqDirective, ProxyReqHook, RedirectHandler};
use layout_proxy::http::request::{OutgoingRequestOptions, ProxyRequestContext};

mod common;

use common::{client, json_response, proxy_config, raw_response, start_proxy, start_proxy_with_hooks, start_upstream};

struct Deny;

#[async_trait]
impl ProxyReqHook for Deny {
    async fn on_proxy_req(
        &self,
        _ctx: &ProxyRequestContext,
        _outgoing: OutgoingRequestOptions,
    ) -> Result<ProxyReqDirective> {
        let mut response = Response::new(Body::from("login required"));
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        Ok(ProxyReqDirective::Respond(response))
    }
}

struct AddEditingHeader;

#[async_trait]
impl ProxyReqHook for AddEditingHeader {
    async fn on_proxy_req(
        &self,
        ctx: &ProxyRequestContext,
        mut outgoing: OutgoingRequestOptions,
    ) -> Result<ProxyReqDirective> {
        if ctx.url().starts_with("/api") {
            outgoing
                .headers
                .insert("x-editing", HeaderValue::from_static("true"));
        }
        Ok(ProxyReqDirective::Continue(outgoing))
    }
}

struct LoginRedirect;

#[async_trait]
impl RedirectHandler for LoginRedirect {
    async fn handle_redirect(
        &self,
        _ctx: &ProxyRequestContext,
        upstream: Response<Body>,
    ) -> Result<Response<Body>> {
        let location = upstream
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(Response::new(Body::from(format!("redirect to {}", location))))
    }
}

#[tokio::test]
async fn on_proxy_req_can_answer_without_upstream() {
    let mut upstream = start_upstream(vec![json_response("{}")]).await;
    let hooks = ProxyHooks::new().with_on_proxy_req(Deny);
    let proxy = start_proxy_with_hooks(proxy_config(&upstream), hooks).await;

    let res = client().get(proxy.url("/api/secret")).send().await.unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.text().await.unwrap(), "login required");
    assert!(upstream.saw_no_request().await);
}

#[tokio::test]
async fn on_proxy_req_changes_outgoing_request() {
    let mut upstream = start_upstream(vec![raw_response("200 OK", &[], b"ok")]).await;
    let hooks = ProxyHooks::new().with_on_proxy_req(AddEditingHeader);
    let proxy = start_proxy_with_hooks(proxy_config(&upstream), hooks).await;

    client().get(proxy.url("/api/item")).send().await.unwrap();

    let request = upstream.next_request().await;
    assert_eq!(request.header("x-editing").as_deref(), Some("true"));
}

#[tokio::test]
async fn layout_data_hook_modifies_payload() {
    let upstream = start_upstream(vec![json_response(r#"{"sitecore":{"route":{"name":"home"}}}"#)]).await;
    let hooks = ProxyHooks::new().with_modify_layout_service_data(|data, ctx| {
        let mut data = data?;
        data["requestedUrl"] = Value::String(ctx.url().to_string());
        Some(data)
    });
    let proxy = start_proxy_with_hooks(proxy_config(&upstream), hooks).await;

    let res = client().get(proxy.url("/?q=1")).send().await.unwrap();

    let body: Value = res.json().await.unwrap();
    assert_eq!(
        body,
        json!({"sitecore": {"route": {"name": "home"}}, "requestedUrl": "/?q=1"})
    );
}

#[tokio::test]
async fn cookie_hook_rewrites_set_cookie() {
    let upstream = start_upstream(vec![raw_response(
        "200 OK",
        &[("Set-Cookie", "token=abc; Domain=cm.local; Path=/")],
        b"ok",
    )])
    .await;
    let hooks = ProxyHooks::new().with_modify_cookies(|mut cookies| {
        for cookie in &mut cookies {
            cookie.remove_attribute("domain");
        }
        cookies
    });
    let proxy = start_proxy_with_hooks(proxy_config(&upstream), hooks).await;

    let res = client().get(proxy.url("/api/login")).send().await.unwrap();

    assert_eq!(res.headers()["set-cookie"], "token=abc; Path=/");
}

#[tokio::test]
async fn dev_mode_strips_secure_from_auth_cookie() {
    let upstream = start_upstream(vec![raw_response(
        "200 OK",
        &[("Set-Cookie", ".AspNet.Cookies=ticket; path=/; secure; HttpOnly")],
        b"ok",
    )])
    .await;
    let mut config = proxy_config(&upstream);
    config.proxy.dev_mode = true;
    let proxy = start_proxy(config).await;

    let res = client().get(proxy.url("/api/auth")).send().await.unwrap();

    assert_eq!(res.headers()["set-cookie"], ".AspNet.Cookies=ticket; path=/; HttpOnly");
}

#[tokio::test]
async fn redirect_handler_owns_redirect_responses() {
    let upstream = start_upstream(vec![raw_response(
        "302 Found",
        &[("Location", "/sitecore/login")],
        b"",
    )])
    .await;
    let hooks = ProxyHooks::new().with_redirect_handler(LoginRedirect);
    let proxy = start_proxy_with_hooks(proxy_config(&upstream), hooks).await;

    // POST is not followed by the transport, so the handler sees the 302.
    let res = client().post(proxy.url("/api/form")).send().await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "redirect to /sitecore/login");
}
