use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

/// Request and configuration level errors
#[derive(Error, Debug)]
pub enum FailoverError {
    // Client errors
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Malformed proxy credentials: {0}")]
    MalformedCredentials(String),

    // Backend errors
    #[error("No eligible backend accepted the tunnel")]
    NoBackendAvailable,

    #[error("Connection takeover failed: {0}")]
    HijackFailed(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid backend template {descriptor}: {source}")]
    InvalidTemplate {
        descriptor: String,
        #[source]
        source: TemplateError,
    },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for failover operations
pub type Result<T> = std::result::Result<T, FailoverError>;

impl FailoverError {
    /// Get the HTTP status code surfaced to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            FailoverError::InvalidRequest(_) | FailoverError::MalformedCredentials(_) => {
                StatusCode::BAD_REQUEST
            }

            FailoverError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,

            FailoverError::HijackFailed(_) => StatusCode::BAD_GATEWAY,

            FailoverError::NoBackendAvailable => StatusCode::SERVICE_UNAVAILABLE,

            FailoverError::InvalidConfig(_)
            | FailoverError::InvalidTemplate { .. }
            | FailoverError::Tls(_)
            | FailoverError::Io(_)
            | FailoverError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl From<hyper::Error> for FailoverError {
    fn from(err: hyper::Error) -> Self {
        FailoverError::Http(err.to_string())
    }
}

/// Why a single candidate backend was rejected.
///
/// Every variant is scoped to one trial: the sequencer reports it through the
/// attempt event and moves on to the next candidate.
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("invalid backend URI: {0}")]
    DescriptorParse(String),

    #[error("dial failed: {0}")]
    Dial(#[source] std::io::Error),

    #[error("failed to send CONNECT: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to read CONNECT response: {0}")]
    ResponseParse(String),

    #[error("{0}")]
    Status(#[from] StatusError),

    #[error("{check} check failed: {reason:#}")]
    Check {
        check: &'static str,
        reason: anyhow::Error,
    },

    #[error("trial timed out after {0:?}")]
    Timeout(Duration),
}

impl TrialError {
    /// Short classification for logs
    pub fn kind(&self) -> &'static str {
        match self {
            TrialError::DescriptorParse(_) => "descriptor",
            TrialError::Dial(_) => "dial",
            TrialError::Write(_) => "write",
            TrialError::ResponseParse(_) => "response",
            TrialError::Status(_) => "status",
            TrialError::Check { .. } => "check",
            TrialError::Timeout(_) => "timeout",
        }
    }

    /// Status code carried by a non-2xx rejection, if that is what this is
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TrialError::Status(e) => Some(e.code),
            _ => None,
        }
    }
}

/// A backend answered the CONNECT with a status outside 2xx
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code_num} {reason}", code_num = .code.as_u16())]
pub struct StatusError {
    pub code: StatusCode,
    pub reason: String,
}

impl StatusError {
    /// Builds the error, falling back to the canonical reason phrase when the
    /// backend sent none.
    pub fn new(code: StatusCode, reason: Option<&str>) -> Self {
        let reason = match reason {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => code.canonical_reason().unwrap_or("").to_string(),
        };
        Self { code, reason }
    }
}

/// URI template parse and expansion errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed expression starting at offset {0}")]
    UnclosedExpression(usize),

    #[error("unexpected '}}' at offset {0}")]
    UnexpectedClose(usize),

    #[error("empty variable name in expression at offset {0}")]
    EmptyVariable(usize),

    #[error("invalid variable name {0:?}")]
    InvalidVariable(String),

    #[error("unsupported operator {0:?}")]
    UnsupportedOperator(char),

    #[error("invalid prefix modifier on {0:?}")]
    InvalidPrefix(String),

    #[error("variable {0:?} is not defined")]
    MissingVariable(String),
}
