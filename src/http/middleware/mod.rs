//! Request middleware.

pub mod proxy;

pub use proxy::{layout_proxy, LayoutServiceData, ProxySetupError, ProxyState};
