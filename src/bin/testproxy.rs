//! Minimal upstream CONNECT proxy for trying out failover by hand
//!
//! `TESTPROXY_PORT` picks the port (default 0, any free port) and
//! `TESTPROXY_FAIL=true` makes every CONNECT fail with 502.

use std::convert::Infallible;
use std::env;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use failover::error::{FailoverError, Result};
use failover::proxy::TunnelHandler;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "testproxy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port: u16 = env::var("TESTPROXY_PORT")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .map_err(|_| FailoverError::InvalidConfig("TESTPROXY_PORT must be a valid port number".into()))?;
    let fail = env::var("TESTPROXY_FAIL")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!(fail, "Test proxy listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        continue;
                    }
                };
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, fail));
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await
                    {
                        debug!("Connection error: {}", e);
                    }
                });
            }
            _ = signal::ctrl_c() => {
                info!("Test proxy shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle(req: Request<Incoming>, fail: bool) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::CONNECT {
        return Ok(status(StatusCode::METHOD_NOT_ALLOWED));
    }

    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        return Ok(status(StatusCode::BAD_REQUEST));
    };
    info!("CONNECT {}", target);

    let (parts, body) = req.into_parts();
    let _ = body.collect().await;

    if fail {
        return Ok(status(StatusCode::BAD_GATEWAY));
    }

    let upstream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Dial {} failed: {}", target, e);
            return Ok(status(StatusCode::BAD_GATEWAY));
        }
    };

    let req = Request::from_parts(parts, ());
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let (sent, received) = TunnelHandler::relay(TokioIo::new(upgraded), upstream).await;
                debug!(bytes_sent = sent, bytes_received = received, "Tunnel to {} closed", target);
            }
            Err(e) => warn!("Upgrade failed: {}", e),
        }
    });

    Ok(status(StatusCode::OK))
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = code;
    response
}
