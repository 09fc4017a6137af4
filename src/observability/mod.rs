//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Proxy middleware and upstream invoker produce:
//!     → logging.rs (structured log events, request id as a field)
//!     → metrics.rs (counters and histograms)
//!
//! Consumers:
//!     → stdout
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;
