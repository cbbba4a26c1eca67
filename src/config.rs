use crate::error::{FailoverError, Result};
use crate::proxy::health::TargetScheme;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Upstream backends
    pub backends: BackendsConfig,
    /// Per-trial timeout and optional checks
    pub checks: ChecksConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Port for the proxy server (default: 8080)
    pub port: u16,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackendsConfig {
    /// Backend descriptors in trial order
    pub descriptors: Vec<String>,
    /// Parse descriptors as URI templates
    pub templates: bool,
}

#[derive(Debug, Clone)]
pub struct ChecksConfig {
    /// Bound on dial, response and checks for one candidate
    pub trial_timeout: Option<Duration>,
    /// Run the TLS handshake check
    pub tls: bool,
    /// Run the liveness check
    pub liveness: bool,
    /// Path fetched by the liveness check
    pub liveness_path: String,
    /// URL scheme policy for the liveness check (port, http, https)
    pub liveness_scheme: TargetScheme,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let trial_timeout_ms: u64 = get_env_or("PROXY_TRIAL_TIMEOUT_MS", "0")
            .parse()
            .map_err(|_| {
                FailoverError::InvalidConfig(
                    "PROXY_TRIAL_TIMEOUT_MS must be a number of milliseconds".into(),
                )
            })?;

        Ok(Config {
            proxy: ProxyServerConfig {
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
                port: get_env_or("PROXY_PORT", "8080").parse().map_err(|_| {
                    FailoverError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
            },
            backends: BackendsConfig {
                descriptors: get_env_or("PROXY_BACKENDS", "")
                    .split_whitespace()
                    .map(ToString::to_string)
                    .collect(),
                templates: get_bool_or("PROXY_TEMPLATES", false)?,
            },
            checks: ChecksConfig {
                trial_timeout: (trial_timeout_ms > 0).then(|| Duration::from_millis(trial_timeout_ms)),
                tls: get_bool_or("PROXY_CHECK_TLS", false)?,
                liveness: get_bool_or("PROXY_CHECK_LIVENESS", false)?,
                liveness_path: get_env_or("PROXY_LIVENESS_PATH", "/favicon.ico"),
                liveness_scheme: get_scheme_or("PROXY_LIVENESS_SCHEME", TargetScheme::ByPort)?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Positional arguments, when given, replace the configured backends
    pub fn with_backend_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let args: Vec<String> = args.into_iter().collect();
        if !args.is_empty() {
            self.backends.descriptors = args;
        }
        self
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_bool_or(key: &str, default: bool) -> Result<bool> {
    let Ok(raw) = env::var(key) else {
        return Ok(default);
    };
    match raw.trim().to_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(FailoverError::InvalidConfig(format!(
            "{} must be true or false, got {:?}",
            key, raw
        ))),
    }
}

fn get_scheme_or(key: &str, default: TargetScheme) -> Result<TargetScheme> {
    let Ok(raw) = env::var(key) else {
        return Ok(default);
    };
    TargetScheme::from_str(&raw).ok_or_else(|| {
        FailoverError::InvalidConfig(format!("{} must be port, http or https, got {:?}", key, raw))
    })
}
