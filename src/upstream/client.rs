//! Upstream transports.
//!
//! # Responsibilities
//! - Hold one plain and one TLS `hyper_util` client for the process
//! - Build the TLS connector from the configured extra TLS options
//! - Pick the transport for a request from the target scheme
//!
//! # Design Decisions
//! - Clients are built once; a request whose TLS options differ from the
//!   process defaults gets a dedicated connector
//! - Connection pooling is left to `hyper_util`; `connection: close` on the
//!   outgoing request disables reuse when no reuse policy is configured

use std::path::Path;

use axum::body::Body;
use axum::http::{Request, Response};
use hyper::body::Incoming;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::config::TlsConfig;

/// Extra TLS options merged into requests for encrypted targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub accept_invalid_certs: bool,
    pub accept_invalid_hostnames: bool,
    /// Additional trusted root certificate, PEM encoded.
    pub root_certificate_pem: Option<Vec<u8>>,
}

impl TlsOptions {
    /// Resolve options from configuration, reading the root certificate file.
    pub fn from_config(config: &TlsConfig) -> Result<Self, std::io::Error> {
        let root_certificate_pem = match &config.root_certificate_path {
            Some(path) => Some(std::fs::read(Path::new(path))?),
            None => None,
        };
        Ok(Self {
            accept_invalid_certs: config.accept_invalid_certs,
            accept_invalid_hostnames: config.accept_invalid_hostnames,
            root_certificate_pem,
        })
    }
}

/// Error building a TLS connector.
#[derive(Debug, thiserror::Error)]
#[error("failed to build TLS connector: {0}")]
pub struct TlsSetupError(#[from] native_tls::Error);

/// Which transport carries a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Tls,
}

impl Transport {
    /// `https` and `wss` style schemes are encrypted.
    pub fn for_scheme(scheme: &str) -> Self {
        if is_secure_scheme(scheme) {
            Transport::Tls
        } else {
            Transport::Plain
        }
    }
}

pub fn is_secure_scheme(scheme: &str) -> bool {
    scheme.starts_with("https") || scheme.starts_with("wss")
}

type PlainClient = Client<HttpConnector, Body>;
type TlsClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Process-wide upstream clients.
#[derive(Clone)]
pub struct UpstreamClient {
    plain: PlainClient,
    tls: TlsClient,
    tls_options: TlsOptions,
}

impl UpstreamClient {
    pub fn new(tls_options: TlsOptions) -> Result<Self, TlsSetupError> {
        let plain = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let tls = build_tls_client(&tls_options)?;
        Ok(Self {
            plain,
            tls,
            tls_options,
        })
    }

    pub fn tls_options(&self) -> &TlsOptions {
        &self.tls_options
    }

    /// Send a request over the selected transport.
    pub async fn send(
        &self,
        transport: Transport,
        tls: Option<&TlsOptions>,
        request: Request<Body>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        match transport {
            Transport::Plain => self.plain.request(request).await,
            Transport::Tls => match tls {
                Some(options) if *options != self.tls_options => {
                    match build_tls_client(options) {
                        Ok(client) => client.request(request).await,
                        Err(e) => {
                            tracing::warn!(error = %e, "Falling back to default TLS options");
                            self.tls.request(request).await
                        }
                    }
                }
                _ => self.tls.request(request).await,
            },
        }
    }
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("tls_options", &self.tls_options)
            .finish_non_exhaustive()
    }
}

fn build_tls_client(options: &TlsOptions) -> Result<TlsClient, TlsSetupError> {
    let mut builder = native_tls::TlsConnector::builder();
    builder
        .danger_accept_invalid_certs(options.accept_invalid_certs)
        .danger_accept_invalid_hostnames(options.accept_invalid_hostnames);
    if let Some(pem) = &options.root_certificate_pem {
        builder.add_root_certificate(native_tls::Certificate::from_pem(pem)?);
    }
    let tls = tokio_native_tls::TlsConnector::from(builder.build()?);

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    let connector = HttpsConnector::from((http, tls));
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}
