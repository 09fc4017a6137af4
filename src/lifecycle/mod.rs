//! Lifecycle management.
//!
//! ```text
//! ctrl-c / SIGTERM → Shutdown::trigger → server stops accepting → in-flight
//! requests drain → exit
//! ```

pub mod shutdown;

pub use shutdown::{wait_for_signal, Shutdown};
