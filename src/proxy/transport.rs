//! Backend transport
//!
//! Dials a backend proxy, sends it a CONNECT derived from the client's own
//! request and parses the response head. Bytes the backend sent past the head
//! are kept in the returned stream and read back first.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::request::Parts;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST, PROXY_AUTHORIZATION, USER_AGENT};
use hyper::{StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{FailoverError, Result, StatusError, TrialError};
use crate::proxy::backend::BackendUri;

/// Upper bound on a backend's CONNECT response head
const MAX_HEAD_LEN: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

/// The inbound CONNECT request, read-only for the whole pipeline
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    target: String,
    headers: HeaderMap,
    remote_addr: SocketAddr,
}

impl ConnectRequest {
    pub fn new(target: impl Into<String>, headers: HeaderMap, remote_addr: SocketAddr) -> Self {
        Self {
            target: target.into(),
            headers,
            remote_addr,
        }
    }

    /// Build from the parts of an inbound CONNECT; the target is the
    /// authority of the request line.
    pub fn from_parts(parts: &Parts, remote_addr: SocketAddr) -> Result<Self> {
        let target = connect_target(&parts.uri).ok_or_else(|| {
            FailoverError::InvalidRequest(format!("CONNECT target has no authority: {}", parts.uri))
        })?;
        Ok(Self::new(target, parts.headers.clone(), remote_addr))
    }

    /// `host:port` as requested by the client
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Target host without port or IPv6 brackets
    pub fn target_host(&self) -> &str {
        let host = match self.target.rsplit_once(':') {
            Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
            _ => self.target.as_str(),
        };
        host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
    }

    pub fn target_port(&self) -> Option<u16> {
        self.target
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn user_agent(&self) -> Option<&HeaderValue> {
        self.headers.get(USER_AGENT)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

fn connect_target(uri: &Uri) -> Option<String> {
    uri.authority().map(|a| a.to_string())
}

/// Status line and headers of a backend's CONNECT response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Whether the reason phrase differs from the canonical one for the status
    pub fn custom_reason(&self) -> Option<&str> {
        self.reason
            .as_deref()
            .filter(|r| !r.is_empty() && Some(*r) != self.status.canonical_reason())
    }
}

/// A backend connection that replays already-buffered bytes before reading
/// from the socket
#[derive(Debug)]
pub struct BackendStream {
    inner: TcpStream,
    buffered: Bytes,
}

impl BackendStream {
    fn new(inner: TcpStream, buffered: Bytes) -> Self {
        Self { inner, buffered }
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if !self.buffered.is_empty() {
            let n = self.buffered.len().min(buf.remaining());
            let chunk = self.buffered.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A backend that accepted the CONNECT with a 2xx
#[derive(Debug)]
pub struct BackendConnection {
    pub head: ResponseHead,
    pub stream: BackendStream,
}

/// Establishes CONNECT tunnels through backend proxies
pub struct BackendTransport;

impl BackendTransport {
    /// Dial `backend`, send the synthetic CONNECT and require a 2xx answer
    #[instrument(skip(connect, backend), fields(to = %connect.target(), via = %backend.redacted()))]
    pub async fn connect(
        connect: &ConnectRequest,
        backend: &BackendUri,
    ) -> std::result::Result<BackendConnection, TrialError> {
        let addr = backend.dial_addr();
        debug!("Dialing backend at {}", addr);
        let mut stream = TcpStream::connect(&addr).await.map_err(TrialError::Dial)?;

        let request = Self::build_connect_request(connect, backend.proxy_authorization().as_deref());
        stream.write_all(&request).await.map_err(TrialError::Write)?;
        stream.flush().await.map_err(TrialError::Write)?;

        debug!("Awaiting CONNECT response");
        let (head, buffered) = Self::read_response_head(&mut stream).await?;

        if !head.status.is_success() {
            return Err(StatusError::new(head.status, head.reason.as_deref()).into());
        }

        debug!(status = head.status.as_u16(), "Backend accepted CONNECT");
        Ok(BackendConnection {
            head,
            stream: BackendStream::new(stream, buffered),
        })
    }

    /// Serialize the CONNECT for one backend.
    ///
    /// The client's headers are copied as-is except `Host`, which is derived
    /// from the target, and `Proxy-Authorization`, which is replaced by the
    /// backend's own credentials or dropped.
    pub fn build_connect_request(connect: &ConnectRequest, authorization: Option<&str>) -> Vec<u8> {
        let target = connect.target();
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target).into_bytes();

        for (name, value) in connect.headers() {
            if name == HOST || name == PROXY_AUTHORIZATION {
                continue;
            }
            push_header(&mut request, name, value.as_bytes());
        }

        if let Some(authorization) = authorization {
            push_header(&mut request, &PROXY_AUTHORIZATION, authorization.as_bytes());
        }

        request.extend_from_slice(b"\r\n");
        request
    }

    /// Read and parse a response head; returns it with whatever followed it
    pub async fn read_response_head<R>(
        reader: &mut R,
    ) -> std::result::Result<(ResponseHead, Bytes), TrialError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(4 * 1024);
        loop {
            let n = reader
                .read_buf(&mut buf)
                .await
                .map_err(|e| TrialError::ResponseParse(e.to_string()))?;

            if let Some((len, head)) = parse_response_head(&buf)? {
                let rest = buf.split_off(len);
                return Ok((head, rest.freeze()));
            }

            if n == 0 {
                return Err(TrialError::ResponseParse(format!(
                    "unexpected EOF after {} bytes",
                    buf.len()
                )));
            }
            if buf.len() >= MAX_HEAD_LEN {
                return Err(TrialError::ResponseParse(
                    "response head exceeds size limit".to_string(),
                ));
            }
        }
    }
}

fn push_header(request: &mut Vec<u8>, name: &HeaderName, value: &[u8]) {
    request.extend_from_slice(name.as_str().as_bytes());
    request.extend_from_slice(b": ");
    request.extend_from_slice(value);
    request.extend_from_slice(b"\r\n");
}

fn parse_response_head(
    buf: &[u8],
) -> std::result::Result<Option<(usize, ResponseHead)>, TrialError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    let status = res
        .parse(buf)
        .map_err(|e| TrialError::ResponseParse(e.to_string()))?;

    let httparse::Status::Complete(len) = status else {
        return Ok(None);
    };

    let code = res
        .code
        .ok_or_else(|| TrialError::ResponseParse("missing status code".to_string()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|e| TrialError::ResponseParse(format!("invalid status code {}: {}", code, e)))?;
    let reason = res.reason.map(ToOwned::to_owned);
    let headers = res
        .headers
        .iter()
        .filter_map(|h| {
            let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            let value = HeaderValue::from_bytes(h.value).ok()?;
            Some((name, value))
        })
        .collect();

    Ok(Some((
        len,
        ResponseHead {
            status,
            reason,
            headers,
        },
    )))
}
