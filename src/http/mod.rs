//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (axum setup, request id, tracing)
//!     → middleware/proxy.rs (classify, proxy or pass through)
//!         → request.rs (context, options, outgoing request)
//!         → [upstream invoker]
//!         → response.rs (head rewriting, cookies.rs, layout interception)
//!     → renderer (chainable layout data only)
//!     → Send to client
//! ```

pub mod cookies;
pub mod middleware;
pub mod request;
pub mod response;
pub mod server;

pub use server::HttpServer;

/// Request id header, set when absent and echoed on the response.
pub const X_REQUEST_ID: &str = "x-request-id";
