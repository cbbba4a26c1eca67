//! Failover proxy implementation
//!
//! This module provides the proxy server functionality including:
//! - Credential variables from the client's `Proxy-Authorization`
//! - Literal and URI template backends resolved per request
//! - Ordered trials with optional TLS and liveness checks
//! - The CONNECT tunnel relay

pub mod auth;
pub mod backend;
pub mod events;
pub mod failover;
pub mod handler;
pub mod health;
pub mod server;
pub mod template;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::{BackendDescriptor, BackendUri, CandidateResolver};
pub use events::{TracingEvents, TunnelEvents};
pub use failover::TrialSequencer;
pub use handler::ProxyHandler;
pub use health::{Check, LivenessCheck, TargetScheme, TlsHandshakeCheck};
pub use server::ProxyServer;
pub use transport::{BackendTransport, ConnectRequest};
pub use tunnel::TunnelHandler;
