//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the axum `Router`: proxy middleware in front of the renderer
//! - Wire up request-id and trace layers
//! - Serve with peer addresses and graceful shutdown
//!
//! # Design Decisions
//! - The renderer is a stand-in for the page rendering pipeline: it returns
//!   the layout data attached by the proxy middleware as JSON

use std::net::SocketAddr;

use axum::extract::Extension;
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{middleware, Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::hooks::ProxyHooks;
use crate::http::middleware::{layout_proxy, LayoutServiceData, ProxySetupError, ProxyState};
use crate::http::X_REQUEST_ID;

/// HTTP server for the layout proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
}

impl HttpServer {
    /// Create a server with no caller hooks.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxySetupError> {
        Self::with_hooks(config, ProxyHooks::default())
    }

    pub fn with_hooks(config: ProxyConfig, hooks: ProxyHooks) -> Result<Self, ProxySetupError> {
        let state = ProxyState::from_config(&config, hooks)?;
        tracing::debug!(
            patterns = ?state.classifier().routes().patterns().collect::<Vec<_>>(),
            "Route table compiled"
        );
        let router = Self::build_router(state);
        Ok(Self { router, config })
    }

    fn build_router(state: ProxyState) -> Router {
        let x_request_id = HeaderName::from_static(X_REQUEST_ID);

        Router::new()
            .fallback(render_layout)
            .layer(middleware::from_fn_with_state(state, layout_proxy))
            .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            api_host = %self.config.sitecore.api_host,
            site = %self.config.sitecore.site_name,
            "HTTP server starting"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// Render the attached layout data as JSON, with the layout service status.
async fn render_layout(layout: Option<Extension<LayoutServiceData>>) -> Response {
    match layout {
        Some(Extension(LayoutServiceData {
            data: Some(data),
            head,
        })) => (head.status, Json(data)).into_response(),
        _ => (StatusCode::NOT_FOUND, Json(Value::Null)).into_response(),
    }
}
