//! Backend descriptors and per-request candidate resolution
//!
//! Descriptors are fixed at startup and their order is the trial priority.
//! For each request the resolver turns them into the concrete candidate URIs
//! eligible for that request's credential variables.

use std::fmt;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use tracing::debug;
use url::Url;

use crate::error::{FailoverError, Result, TrialError};
use crate::proxy::auth::basic_credentials;
use crate::proxy::template::{UriTemplate, Variables};

/// One configured upstream proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendDescriptor {
    /// Used verbatim for every request
    Literal(String),
    /// Eligible only when the client offers every variable it references
    Template(UriTemplate),
}

impl BackendDescriptor {
    pub fn literal(raw: impl Into<String>) -> Self {
        Self::Literal(raw.into())
    }

    pub fn template(raw: &str) -> Result<Self> {
        UriTemplate::parse(raw)
            .map(Self::Template)
            .map_err(|source| FailoverError::InvalidTemplate {
                descriptor: raw.to_string(),
                source,
            })
    }

    /// Parse a list of descriptors, as templates when `templates` is set
    pub fn parse_all<S: AsRef<str>>(raw: &[S], templates: bool) -> Result<Vec<Self>> {
        raw.iter()
            .map(|r| {
                if templates {
                    Self::template(r.as_ref())
                } else {
                    Ok(Self::literal(r.as_ref()))
                }
            })
            .collect()
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Literal(raw) => raw,
            Self::Template(t) => t.as_str(),
        }
    }
}

/// Resolves the ordered candidates for one request
#[derive(Debug, Clone)]
pub struct CandidateResolver {
    descriptors: Arc<[BackendDescriptor]>,
}

impl CandidateResolver {
    pub fn new(descriptors: Vec<BackendDescriptor>) -> Self {
        Self {
            descriptors: descriptors.into(),
        }
    }

    /// Concrete candidate URIs in descriptor order.
    ///
    /// A template is skipped when a variable it references is missing or when
    /// it fails to expand; neither affects the other descriptors.
    pub fn resolve(&self, vars: &Variables) -> Vec<String> {
        self.descriptors
            .iter()
            .filter_map(|descriptor| match descriptor {
                BackendDescriptor::Literal(raw) => Some(raw.clone()),
                BackendDescriptor::Template(t) => {
                    if !t.is_satisfied_by(vars) {
                        return None;
                    }
                    match t.expand(vars) {
                        Ok(uri) => Some(uri),
                        Err(e) => {
                            debug!(template = %t, error = %e, "Skipping backend template");
                            None
                        }
                    }
                }
            })
            .collect()
    }
}

/// A candidate parsed into something that can be dialed
#[derive(Debug, Clone)]
pub struct BackendUri {
    raw: String,
    url: Url,
}

impl BackendUri {
    /// Parse a candidate; a missing scheme means `http://`
    pub fn parse(raw: &str) -> std::result::Result<Self, TrialError> {
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| TrialError::DescriptorParse(format!("{}: {}", raw, e)))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(TrialError::DescriptorParse(format!("{}: missing host", raw)));
        }

        Ok(Self {
            raw: raw.to_string(),
            url,
        })
    }

    /// The candidate exactly as resolved
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port` to dial, defaulting the port for the scheme
    pub fn dial_addr(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        let port = self.url.port_or_known_default().unwrap_or(80);
        format!("{}:{}", host, port)
    }

    /// `Proxy-Authorization` value for the embedded credentials, if any
    pub fn proxy_authorization(&self) -> Option<String> {
        if self.url.username().is_empty() && self.url.password().is_none() {
            return None;
        }
        let username = percent_decode_str(self.url.username()).decode_utf8_lossy();
        let password = self
            .url
            .password()
            .map(|p| percent_decode_str(p).decode_utf8_lossy())
            .unwrap_or_default();
        Some(basic_credentials(&username, &password))
    }

    /// The URI with any password masked, for logs
    pub fn redacted(&self) -> String {
        if self.url.password().is_none() {
            return self.url.to_string();
        }
        let mut url = self.url.clone();
        let _ = url.set_password(Some("***"));
        url.to_string()
    }
}

impl fmt::Display for BackendUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Mask the password of a raw candidate, leaving unparsable input unchanged
pub fn redact(raw: &str) -> String {
    BackendUri::parse(raw)
        .map(|uri| uri.redacted())
        .unwrap_or_else(|_| raw.to_string())
}
