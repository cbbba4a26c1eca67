//! Supplementary backend checks
//!
//! A check runs after a backend has already accepted the CONNECT with a 2xx
//! and decides whether the backend may carry the tunnel. Checks open their
//! own auxiliary connections; the primary tunnel connection is never touched.

mod liveness;
mod tls;

pub use liveness::{LivenessCheck, TargetScheme};
pub use tls::TlsHandshakeCheck;

use async_trait::async_trait;

use crate::proxy::backend::BackendUri;
use crate::proxy::transport::ConnectRequest;

/// A predicate over one candidate backend.
///
/// Cancellation is by drop: the sequencer abandons the future when the
/// per-trial timeout fires, so implementations must not hold state that
/// outlives the call.
#[async_trait]
pub trait Check: Send + Sync {
    /// Short name used in logs and error messages
    fn name(&self) -> &'static str;

    /// `Ok` when the backend is acceptable for `connect`
    async fn check(&self, connect: &ConnectRequest, backend: &BackendUri) -> anyhow::Result<()>;
}
