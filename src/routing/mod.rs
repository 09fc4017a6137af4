//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (method, path, query)
//!     → classifier.rs (skip / direct proxy / transform)
//!     → matcher.rs (do-not-proxy and direct-proxy prefix lists)
//!     → router.rs (app route table → layout service item + language)
//!     → Return: Classification with a resolved upstream target
//!
//! Route Compilation (at startup):
//!     route patterns (least complex first)
//!     → Compile to anchored regexes
//!     → Insert each ahead of the previous ones
//!     → Freeze as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Rules compiled at startup, immutable at runtime
//! - Deterministic: same input always classifies the same way
//! - First match wins

pub mod classifier;
pub mod matcher;
pub mod router;

pub use classifier::{Classification, RouteClassifier, SkipReason};
pub use router::{ResolvedRoute, RouteMatch, RouteTable};
