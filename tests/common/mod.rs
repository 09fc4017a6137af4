//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use layout_proxy::config::ProxyConfig;
use layout_proxy::hooks::ProxyHooks;
use layout_proxy::{HttpServer, Shutdown};

pub const API_KEY: &str = "{TEST-KEY}";
pub const SITE_NAME: &str = "website";

/// A raw request as received by a mock upstream.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    /// Request line and headers, lowercased header names as sent.
    pub head: String,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    /// First value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

/// A mock upstream serving scripted raw responses.
pub struct MockUpstream {
    pub addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<CapturedRequest>,
}

impl MockUpstream {
    /// Wait for the next captured request.
    pub async fn next_request(&mut self) -> CapturedRequest {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("upstream saw no request")
            .expect("upstream stopped")
    }

    /// True when no request reached the upstream within a short grace period.
    pub async fn saw_no_request(&mut self) -> bool {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.requests.try_recv().is_err()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Build a raw HTTP/1.1 response.
pub fn raw_response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", status);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));
    let mut out = out.into_bytes();
    out.extend_from_slice(body);
    out
}

pub fn json_response(body: &str) -> Vec<u8> {
    raw_response("200 OK", &[("Content-Type", "application/json")], body.as_bytes())
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Start an upstream answering connection `n` with `responses[n]`; the last
/// response repeats once the script runs out.
pub async fn start_upstream(responses: Vec<Vec<u8>>) -> MockUpstream {
    start_upstream_with(|_| responses).await
}

/// Like [`start_upstream`], with the script built from the bound address.
pub async fn start_upstream_with<F>(script: F) -> MockUpstream
where
    F: FnOnce(SocketAddr) -> Vec<Vec<u8>>,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, requests) = mpsc::unbounded_channel();
    let responses = Arc::new(script(addr));
    let served = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            let responses = responses.clone();
            let index = served.fetch_add(1, Ordering::SeqCst).min(responses.len() - 1);
            tokio::spawn(async move {
                if let Some(request) = read_request(&mut socket).await {
                    let _ = tx.send(request);
                }
                let _ = socket.write_all(&responses[index]).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    MockUpstream { addr, requests }
}

/// An upstream that reads the request and never answers.
///
/// The returned receiver yields once the proxy closes the connection.
pub async fn start_silent_upstream() -> (MockUpstream, mpsc::UnboundedReceiver<()>) {
    start_stalling_upstream(Vec::new()).await
}

/// An upstream that writes `prefix` after the request, then goes quiet.
///
/// The returned receiver yields once the proxy closes the connection.
pub async fn start_stalling_upstream(
    prefix: Vec<u8>,
) -> (MockUpstream, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, requests) = mpsc::unbounded_channel();
    let (closed_tx, closed) = mpsc::unbounded_channel();
    let prefix = Arc::new(prefix);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            let closed_tx = closed_tx.clone();
            let prefix = prefix.clone();
            tokio::spawn(async move {
                if let Some(request) = read_request(&mut socket).await {
                    let _ = tx.send(request);
                }
                if !prefix.is_empty() {
                    let _ = socket.write_all(&prefix).await;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
                let _ = closed_tx.send(());
            });
        }
    });

    (MockUpstream { addr, requests }, closed)
}

async fn read_request(socket: &mut TcpStream) -> Option<CapturedRequest> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find(&data, b"\r\n\r\n") {
            break pos;
        }
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let mut body = data[head_end + 4..].to_vec();
    let request = CapturedRequest {
        head,
        body: Vec::new(),
    };

    if let Some(length) = request.header("content-length").and_then(|v| v.parse::<usize>().ok()) {
        while body.len() < length {
            let n = socket.read(&mut buf).await.ok()?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }
    } else if request
        .header("transfer-encoding")
        .map(|v| v.contains("chunked"))
        .unwrap_or(false)
    {
        while find(&body, b"0\r\n\r\n").is_none() {
            let n = socket.read(&mut buf).await.ok()?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }
    }

    Some(CapturedRequest { body, ..request })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Proxy configuration pointing at `upstream`.
pub fn proxy_config(upstream: &MockUpstream) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.sitecore.api_host = upstream.base_url();
    config.sitecore.api_key = API_KEY.into();
    config.sitecore.site_name = SITE_NAME.into();
    config
}

/// A running proxy server.
pub struct TestProxy {
    pub addr: SocketAddr,
    shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    start_proxy_with_hooks(config, ProxyHooks::default()).await
}

pub async fn start_proxy_with_hooks(config: ProxyConfig, hooks: ProxyHooks) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::with_hooks(config, hooks).unwrap();
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });
    TestProxy { addr, shutdown }
}

/// Client that never follows redirects or pools connections.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
