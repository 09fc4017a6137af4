//! Layout service proxy middleware.
//!
//! Sits in front of a page renderer and talks to a headless CMS layout
//! service: requests for app routes are rewritten into layout service queries
//! and the parsed payload is handed to the renderer; API and media paths are
//! forwarded verbatim; static assets pass straight through.

pub mod config;
pub mod error;
pub mod hooks;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod routing;
pub mod upstream;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use hooks::ProxyHooks;
pub use http::middleware::{layout_proxy, LayoutServiceData, ProxyState};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
