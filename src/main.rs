//! Layout proxy server.
//!
//! ```text
//!   client ──▶ request id / trace ──▶ layout proxy ──▶ renderer
//!                                          │
//!                                          ▼
//!                                   layout service (CMS)
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use layout_proxy::config::{load_config, ProxyConfig};
use layout_proxy::lifecycle::{wait_for_signal, Shutdown};
use layout_proxy::observability::{logging, metrics};
use layout_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "layout-proxy")]
#[command(about = "Proxy middleware between a page renderer and a headless CMS layout service", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init_tracing(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "layout-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        api_host = %config.sitecore.api_host,
        timeout_ms = config.proxy.timeout_ms,
        dev_mode = config.proxy.dev_mode,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(config)?;

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.trigger();
    });

    server.run(listener, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
