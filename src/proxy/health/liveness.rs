use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::redirect::Policy;
use tracing::debug;

use crate::proxy::backend::BackendUri;
use crate::proxy::health::Check;
use crate::proxy::transport::ConnectRequest;

pub const DEFAULT_PATH: &str = "/favicon.ico";

/// How the URL scheme of the probed target is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetScheme {
    /// Port 80 is `http`, anything else is `https`
    #[default]
    ByPort,
    Http,
    Https,
}

impl TargetScheme {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "port" | "" => Some(Self::ByPort),
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }
}

/// Fetches a harmless resource on the target through the backend.
///
/// The request looks like a browser preloading an image so that the origin
/// treats it as passive. Only a 2xx answer passes.
pub struct LivenessCheck {
    path: String,
    headers: HeaderMap,
    scheme: TargetScheme,
}

impl Default for LivenessCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessCheck {
    pub fn new() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            headers: preload_headers(),
            scheme: TargetScheme::ByPort,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        self
    }

    /// Replace the request headers. `Referer` and `User-Agent` are still
    /// filled in per request unless present here.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_scheme(mut self, scheme: TargetScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Origin root URL for the CONNECT target, without a trailing slash
    fn origin(&self, connect: &ConnectRequest) -> String {
        let host = connect.target_host();
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };

        let port = connect.target_port();
        let (scheme, default_port) = match (self.scheme, port) {
            (TargetScheme::Http, _) | (TargetScheme::ByPort, Some(80)) => ("http", 80),
            _ => ("https", 443),
        };

        match port {
            Some(p) if p != default_port => format!("{}://{}:{}", scheme, host, p),
            _ => format!("{}://{}", scheme, host),
        }
    }

    fn request_headers(&self, connect: &ConnectRequest, origin: &str) -> HeaderMap {
        let mut headers = self.headers.clone();
        if !headers.contains_key(header::REFERER) {
            if let Ok(referer) = HeaderValue::from_str(&format!("{}/", origin)) {
                headers.insert(header::REFERER, referer);
            }
        }
        if !headers.contains_key(header::USER_AGENT) {
            let agent = connect
                .user_agent()
                .and_then(|ua| HeaderValue::from_bytes(ua.as_bytes()).ok());
            if let Some(agent) = agent {
                headers.insert(header::USER_AGENT, agent);
            }
        }
        headers
    }
}

fn preload_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8"),
    );
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("image"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("no-cors"));
    headers
}

#[async_trait]
impl Check for LivenessCheck {
    fn name(&self) -> &'static str {
        "liveness"
    }

    async fn check(&self, connect: &ConnectRequest, backend: &BackendUri) -> anyhow::Result<()> {
        let origin = self.origin(connect);
        let url = format!("{}{}", origin, self.path);

        let proxy = reqwest::Proxy::all(backend.url().as_str()).context("invalid backend proxy URL")?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .redirect(Policy::none())
            .build()
            .context("failed to build HTTP client")?;

        debug!(url = %url, backend = %backend.redacted(), "Probing target through backend");
        let response = client
            .get(&url)
            .headers(self.request_headers(connect, &origin))
            .send()
            .await
            .map_err(|e| anyhow!(e).context(format!("GET {} failed", url)))?;

        let status = response.status();
        // Drain so the auxiliary connection closes cleanly
        response
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {}", url))?;

        if !status.is_success() {
            bail!("GET {} returned {}", url, status);
        }
        Ok(())
    }
}
