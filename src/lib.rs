//! Failover - fault-tolerant CONNECT proxy
//!
//! Tunnels client CONNECT requests through an ordered list of upstream HTTP
//! proxies, moving on to the next one whenever a backend is unreachable,
//! refuses the tunnel or fails a supplementary check.
//!
//! ## Features
//!
//! - Literal backends, or URI template backends selected by client tags
//! - Strictly sequential trials with an optional per-trial timeout
//! - TLS handshake and liveness checks against the real target
//! - Byte-counting tunnel relay with per-attempt and per-tunnel events

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{FailoverError, Result};
