//! Ordered trial of candidate backends
//!
//! Candidates are tried one at a time in the order they were resolved. A
//! trial dials the backend, sends the CONNECT, requires a 2xx and then runs
//! every configured check. The first candidate to clear all of that is
//! accepted; every other outcome moves on to the next candidate.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::TrialError;
use crate::proxy::backend::BackendUri;
use crate::proxy::events::TunnelEvents;
use crate::proxy::health::Check;
use crate::proxy::transport::{BackendConnection, BackendTransport, ConnectRequest};

/// The winning trial
#[derive(Debug)]
pub struct Accepted {
    /// Candidate URI as resolved
    pub backend: String,
    pub connection: BackendConnection,
}

/// Runs trials for one request at a time; shared across requests
#[derive(Clone, Default)]
pub struct TrialSequencer {
    timeout: Option<Duration>,
    checks: Vec<Arc<dyn Check>>,
}

impl TrialSequencer {
    pub fn new(timeout: Option<Duration>, checks: Vec<Arc<dyn Check>>) -> Self {
        Self { timeout, checks }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Names of the configured checks, in execution order
    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Try `candidates` in order and return the first accepted one.
    ///
    /// `events` hears about every trial, the accepted one included.
    pub async fn run(
        &self,
        connect: &ConnectRequest,
        candidates: &[String],
        events: &dyn TunnelEvents,
    ) -> Option<Accepted> {
        for candidate in candidates {
            match self.trial(connect, candidate).await {
                Ok(connection) => {
                    events.on_attempt(connect, candidate, None);
                    return Some(Accepted {
                        backend: candidate.clone(),
                        connection,
                    });
                }
                Err(e) => events.on_attempt(connect, candidate, Some(&e)),
            }
        }
        None
    }

    async fn trial(
        &self,
        connect: &ConnectRequest,
        candidate: &str,
    ) -> Result<BackendConnection, TrialError> {
        let attempt = self.attempt(connect, candidate);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .map_err(|_| TrialError::Timeout(limit))?,
            None => attempt.await,
        }
    }

    async fn attempt(
        &self,
        connect: &ConnectRequest,
        candidate: &str,
    ) -> Result<BackendConnection, TrialError> {
        let backend = BackendUri::parse(candidate)?;
        let connection = BackendTransport::connect(connect, &backend).await?;

        for check in &self.checks {
            debug!(check = check.name(), backend = %backend.redacted(), "Running check");
            check
                .check(connect, &backend)
                .await
                .map_err(|reason| TrialError::Check {
                    check: check.name(),
                    reason,
                })?;
        }

        Ok(connection)
    }
}
