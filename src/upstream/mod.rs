//! Upstream subsystem.
//!
//! # Data Flow
//! ```text
//! ProxyRequestContext + ProxyOptions
//!     → invoker.rs (hook, body streaming, timeout, error classification)
//!     → redirect.rs (optional redirect following)
//!     → client.rs (plain / TLS transport)
//!     → http::response (head rewriting, layout interception)
//! ```

pub mod client;
pub mod invoker;
pub mod redirect;

pub use client::{TlsOptions, UpstreamClient};
pub use invoker::{invoke, InvokeOutcome};
