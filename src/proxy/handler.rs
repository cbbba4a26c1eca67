//! CONNECT request handler
//!
//! Turns one inbound CONNECT into a tunnel through the first backend that
//! survives its trial, or into an error response.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::ext::ReasonPhrase;
use hyper::header::HeaderMap;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{FailoverError, Result};
use crate::proxy::auth::extract_variables;
use crate::proxy::backend::CandidateResolver;
use crate::proxy::events::TunnelEvents;
use crate::proxy::failover::{Accepted, TrialSequencer};
use crate::proxy::transport::{ConnectRequest, ResponseHead};
use crate::proxy::tunnel::TunnelHandler;

/// Proxy request handler
pub struct ProxyHandler {
    resolver: CandidateResolver,
    sequencer: TrialSequencer,
    events: Arc<dyn TunnelEvents>,
}

impl ProxyHandler {
    pub fn new(
        resolver: CandidateResolver,
        sequencer: TrialSequencer,
        events: Arc<dyn TunnelEvents>,
    ) -> Self {
        Self {
            resolver,
            sequencer,
            events,
        }
    }

    /// Handle an incoming proxy request
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri(), from = %remote_addr))]
    pub async fn handle<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        match self.handle_connect(req, remote_addr).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_server_error() {
                    warn!("CONNECT failed: {}", e);
                } else {
                    debug!("CONNECT rejected: {}", e);
                }
                error_response(&e)
            }
        }
    }

    async fn handle_connect<B>(
        &self,
        req: Request<B>,
        remote_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        if req.method() != Method::CONNECT {
            return Err(FailoverError::MethodNotAllowed(req.method().to_string()));
        }

        let (mut parts, body) = req.into_parts();
        // Nothing in a CONNECT body is meaningful; consume it before any trial
        if let Err(e) = body.collect().await {
            debug!("Discarding unreadable request body: {}", e);
        }

        let connect = ConnectRequest::from_parts(&parts, remote_addr)?;
        let vars = extract_variables(connect.headers())?;

        let on_upgrade = parts.extensions.remove::<OnUpgrade>().ok_or_else(|| {
            FailoverError::HijackFailed("connection does not support takeover".to_string())
        })?;

        let candidates = self.resolver.resolve(&vars);
        debug!(
            to = %connect.target(),
            candidates = candidates.len(),
            "Resolved backend candidates"
        );

        let Some(Accepted {
            backend,
            connection,
        }) = self
            .sequencer
            .run(&connect, &candidates, self.events.as_ref())
            .await
        else {
            return Err(FailoverError::NoBackendAvailable);
        };

        info!(to = %connect.target(), "CONNECT tunnel established");
        let response = tunnel_response(&connection.head);

        let events = self.events.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    let (sent, received) = TunnelHandler::relay(client, connection.stream).await;
                    events.on_tunnel_closed(&connect, &backend, sent, received);
                }
                Err(e) => {
                    error!(to = %connect.target(), "CONNECT upgrade failed: {}", e);
                }
            }
        });

        Ok(response)
    }
}

/// The client's response mirrors the accepted backend's
fn tunnel_response(head: &ResponseHead) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = head.status;
    *response.headers_mut() = forwarded_headers(&head.headers);

    if let Some(reason) = head.custom_reason() {
        match ReasonPhrase::try_from(reason.as_bytes().to_vec()) {
            Ok(phrase) => {
                response.extensions_mut().insert(phrase);
            }
            Err(_) => debug!("Dropping unrepresentable reason phrase {:?}", reason),
        }
    }

    response
}

fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop_header(name.as_str()) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}

/// Create an error response
fn error_response(err: &FailoverError) -> Response<Full<Bytes>> {
    let status = err.status_code();
    let body = if status == StatusCode::METHOD_NOT_ALLOWED {
        Bytes::new()
    } else {
        Bytes::from(err.to_string())
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    if status != StatusCode::METHOD_NOT_ALLOWED {
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain"),
        );
    }
    response
}

/// Check if a header is owned by the serving connection and must not be
/// copied from the backend's response
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "content-length"
            | "upgrade"
    )
}
