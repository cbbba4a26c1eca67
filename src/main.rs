//! Failover Proxy Server - Entry Point
//!
//! Loads configuration, builds the backend list and checks, and serves
//! CONNECT requests until Ctrl+C or SIGTERM.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use failover::config::{Config, LogConfig};
use failover::error;
use failover::proxy::{
    BackendDescriptor, CandidateResolver, Check, LivenessCheck, ProxyHandler, ProxyServer,
    TlsHandshakeCheck, TracingEvents, TrialSequencer,
};

#[tokio::main]
async fn main() -> error::Result<()> {
    // Positional arguments replace PROXY_BACKENDS
    let config = Config::from_env()?.with_backend_args(std::env::args().skip(1));

    init_tracing(&config.log);
    info!("Starting Failover Proxy Server");

    let descriptors =
        BackendDescriptor::parse_all(config.backends.descriptors.as_slice(), config.backends.templates)?;
    if descriptors.is_empty() {
        warn!("No backends configured; every CONNECT will be answered with 503");
    }
    for (position, descriptor) in descriptors.iter().enumerate() {
        info!(position, backend = %failover::proxy::backend::redact(descriptor.as_str()), "Backend configured");
    }

    let mut checks: Vec<Arc<dyn Check>> = Vec::new();
    if config.checks.tls {
        checks.push(Arc::new(TlsHandshakeCheck::new()?));
    }
    if config.checks.liveness {
        checks.push(Arc::new(
            LivenessCheck::new()
                .with_path(config.checks.liveness_path.clone())
                .with_scheme(config.checks.liveness_scheme),
        ));
    }

    let sequencer = TrialSequencer::new(config.checks.trial_timeout, checks);
    info!(
        checks = ?sequencer.check_names(),
        trial_timeout = ?sequencer.timeout(),
        templates = config.backends.templates,
        "Trial pipeline ready"
    );

    let handler = ProxyHandler::new(
        CandidateResolver::new(descriptors),
        sequencer,
        Arc::new(TracingEvents),
    );
    let proxy_server = ProxyServer::new(config.proxy.clone(), handler);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!("Server started - Proxy: {}", config.proxy_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = proxy_task.await;

    info!("Failover Proxy Server stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("failover={}", log.level)));

    if log.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
