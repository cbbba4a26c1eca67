//! Loopback servers and recorders shared by the proxy tests

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::config::ProxyServerConfig;
use crate::error::TrialError;
use crate::proxy::events::TunnelEvents;
use crate::proxy::handler::ProxyHandler;
use crate::proxy::server::ProxyServer;
use crate::proxy::transport::ConnectRequest;

/// A fatal `handshake_failure` alert record
pub const TLS_ALERT: &[u8] = &[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x28];

/// Behaviour of a [`MockBackend`]
#[derive(Clone)]
pub struct MockBackendConfig {
    /// Status answered to CONNECT; only 200 opens a tunnel
    pub connect_status: u16,
    pub reason: &'static str,
    /// Required `user:password`, answered with 407 when wrong or missing
    pub credentials: Option<&'static str>,
    /// Extra headers on the CONNECT response
    pub headers: Vec<(&'static str, &'static str)>,
    /// Bytes sent right after the 200 head, before any target data
    pub greeting: &'static [u8],
    /// Status answered to absolute-form GET requests
    pub get_status: u16,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            connect_status: 200,
            reason: "Connection established",
            credentials: None,
            headers: Vec::new(),
            greeting: b"",
            get_status: 200,
        }
    }
}

/// A minimal upstream HTTP proxy on loopback
pub struct MockBackend {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    pub async fn spawn(config: MockBackendConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let config = config.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = serve_backend(stream, config, recorded).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url_with_credentials(&self, username: &str, password: &str) -> String {
        format!("http://{}:{}@{}", username, password, self.addr)
    }

    /// Request heads received so far, lower-cased
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve_backend(
    mut client: TcpStream,
    config: MockBackendConfig,
    recorded: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let (head, early) = read_head(&mut client).await?;
    recorded.lock().unwrap().push(head.to_ascii_lowercase());

    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();

    if let Some(expected) = config.credentials {
        if offered_credentials(&head).as_deref() != Some(expected) {
            client
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
                .await?;
            return Ok(());
        }
    }

    if method == "GET" {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 4\r\nConnection: close\r\n\r\nicon",
            config.get_status,
            canonical_reason(config.get_status)
        );
        client.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    if config.connect_status != 200 {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\n\r\n",
            config.connect_status,
            canonical_reason(config.connect_status)
        );
        client.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    let Ok(mut upstream) = TcpStream::connect(&target).await else {
        client
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
            .await?;
        return Ok(());
    };

    let mut response = format!("HTTP/1.1 200 {}\r\n", config.reason);
    for (name, value) in &config.headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");
    client.write_all(response.as_bytes()).await?;
    client.write_all(config.greeting).await?;

    upstream.write_all(&early).await?;
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

fn canonical_reason(code: u16) -> &'static str {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

fn offered_credentials(head: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("proxy-authorization") {
            return None;
        }
        let encoded = value.trim().strip_prefix("Basic ")?;
        String::from_utf8(BASE64.decode(encoded).ok()?).ok()
    })
}

/// Read up to the end of a request head; returns it and any bytes after it
pub async fn read_head(stream: &mut TcpStream) -> std::io::Result<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((String::from_utf8_lossy(&buf).into_owned(), rest));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Origin that echoes every byte back until the client half-closes
pub async fn echo_origin() -> SocketAddr {
    spawn_origin(|mut stream| async move {
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
        let _ = writer.shutdown().await;
    })
    .await
}

/// Origin that speaks plain HTTP: anything it receives gets a 400
pub async fn plain_http_origin() -> SocketAddr {
    spawn_origin(|mut stream| async move {
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        let _ = stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
            .await;
    })
    .await
}

/// Origin that answers any ClientHello with a fatal TLS alert
pub async fn tls_alert_origin() -> SocketAddr {
    spawn_origin(|mut stream| async move {
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        let _ = stream.write_all(TLS_ALERT).await;
    })
    .await
}

const ORIGIN_CERT: &[u8] = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/origin.crt"));
const ORIGIN_KEY: &[u8] = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/origin.key"));
const UNRELATED_CA: &[u8] =
    include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/unrelated-ca.crt"));

fn load_certs(pem: &[u8]) -> Vec<rustls::Certificate> {
    rustls_pemfile::certs(&mut &pem[..])
        .unwrap()
        .into_iter()
        .map(rustls::Certificate)
        .collect()
}

/// Origin that completes real TLS handshakes with a certificate for
/// `origin.test`, issued by nobody the client trusts
pub async fn tls_origin() -> SocketAddr {
    let key = rustls_pemfile::pkcs8_private_keys(&mut &ORIGIN_KEY[..])
        .unwrap()
        .into_iter()
        .next()
        .map(rustls::PrivateKey)
        .unwrap();
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(load_certs(ORIGIN_CERT), key)
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    spawn_origin(move |stream| {
        let acceptor = acceptor.clone();
        async move {
            if let Ok(mut tls) = acceptor.accept(stream).await {
                let mut buf = [0u8; 1024];
                let _ = tls.read(&mut buf).await;
            }
        }
    })
    .await
}

/// Client roots holding only a CA unrelated to [`tls_origin`]'s certificate
pub fn unrelated_roots() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(UNRELATED_CA) {
        roots.add(&cert).unwrap();
    }
    roots
}

async fn spawn_origin<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handler(stream));
        }
    });
    addr
}

/// A backend that accepts and immediately hangs up
pub async fn closing_backend() -> SocketAddr {
    spawn_origin(|stream| async move { drop(stream) }).await
}

/// A backend that accepts and never answers
pub async fn silent_backend() -> SocketAddr {
    spawn_origin(|stream| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    })
    .await
}

/// A loopback address with nothing listening on it
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Serve `handler` on a loopback port; dropping the sender stops the server
pub async fn spawn_proxy(handler: ProxyHandler) -> (SocketAddr, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    let server = ProxyServer::new(ProxyServerConfig::default(), handler);
    tokio::spawn(async move { server.serve(listener, rx).await });
    (addr, tx)
}

/// One recorded trial
#[derive(Debug, Clone)]
pub struct Attempt {
    pub backend: String,
    pub kind: Option<&'static str>,
    pub status: Option<StatusCode>,
    pub error: Option<String>,
}

impl Attempt {
    pub fn is_ok(&self) -> bool {
        self.kind.is_none()
    }
}

/// Event sink that keeps everything it is told
#[derive(Default)]
pub struct RecordingEvents {
    attempts: Mutex<Vec<Attempt>>,
    closed: Mutex<Vec<(u64, u64)>>,
}

impl RecordingEvents {
    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn backends(&self) -> Vec<String> {
        self.attempts().into_iter().map(|a| a.backend).collect()
    }

    pub fn closed(&self) -> Vec<(u64, u64)> {
        self.closed.lock().unwrap().clone()
    }

    /// Wait for the first tunnel-closed notification
    pub async fn wait_closed(&self) -> (u64, u64) {
        for _ in 0..500 {
            if let Some(counts) = self.closed().first() {
                return *counts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tunnel was never reported closed");
    }
}

impl TunnelEvents for RecordingEvents {
    fn on_attempt(&self, _connect: &ConnectRequest, backend: &str, error: Option<&TrialError>) {
        self.attempts.lock().unwrap().push(Attempt {
            backend: backend.to_string(),
            kind: error.map(TrialError::kind),
            status: error.and_then(TrialError::status),
            error: error.map(ToString::to_string),
        });
    }

    fn on_tunnel_closed(
        &self,
        _connect: &ConnectRequest,
        _backend: &str,
        client_to_backend: u64,
        backend_to_client: u64,
    ) {
        self.closed
            .lock()
            .unwrap()
            .push((client_to_backend, backend_to_client));
    }
}
