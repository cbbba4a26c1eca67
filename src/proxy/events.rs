//! Request lifecycle notifications
//!
//! The proxy reports every backend trial and every finished tunnel through
//! [`TunnelEvents`]. Logging and metrics live behind this trait.

use tracing::{info, warn};

use crate::error::TrialError;
use crate::proxy::backend::redact;
use crate::proxy::transport::ConnectRequest;

/// Observer for trials and tunnels.
///
/// Implementations must not assume anything outlives the call: the request
/// and error are borrowed for the duration of the notification only.
pub trait TunnelEvents: Send + Sync {
    /// Called once per trial, in candidate order. `error` is `None` for the
    /// accepted backend.
    fn on_attempt(&self, connect: &ConnectRequest, backend: &str, error: Option<&TrialError>);

    /// Called once when both directions of an established tunnel have ended
    fn on_tunnel_closed(
        &self,
        connect: &ConnectRequest,
        backend: &str,
        client_to_backend: u64,
        backend_to_client: u64,
    );
}

/// Default observer that writes structured log lines
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEvents;

impl TunnelEvents for TracingEvents {
    fn on_attempt(&self, connect: &ConnectRequest, backend: &str, error: Option<&TrialError>) {
        let via = redact(backend);
        match error {
            None => info!(
                from = %connect.remote_addr(),
                to = %connect.target(),
                via = %via,
                "OK"
            ),
            Some(e) => warn!(
                from = %connect.remote_addr(),
                to = %connect.target(),
                via = %via,
                kind = e.kind(),
                error = %e,
                "NG"
            ),
        }
    }

    fn on_tunnel_closed(
        &self,
        connect: &ConnectRequest,
        backend: &str,
        client_to_backend: u64,
        backend_to_client: u64,
    ) {
        info!(
            from = %connect.remote_addr(),
            to = %connect.target(),
            via = %redact(backend),
            bytes_sent = client_to_backend,
            bytes_received = backend_to_client,
            "Tunnel closed"
        );
    }
}
