use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rustls::{ClientConfig, InvalidMessage, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{FailoverError, Result};
use crate::proxy::backend::BackendUri;
use crate::proxy::health::Check;
use crate::proxy::transport::{BackendTransport, ConnectRequest};

/// Verifies that a TLS handshake through the backend reaches the real target.
///
/// A backend that terminates TLS itself presents a certificate that does not
/// verify for the target name and fails here. A target that does not speak
/// TLS at all passes.
pub struct TlsHandshakeCheck {
    connector: TlsConnector,
}

impl TlsHandshakeCheck {
    /// Check that trusts the platform's root certificates
    pub fn new() -> Result<Self> {
        let mut root_store = RootCertStore::empty();

        let native_certs = rustls_native_certs::load_native_certs()
            .map_err(|e| FailoverError::Tls(format!("failed to load native certificates: {}", e)))?;
        for cert in native_certs {
            if let Err(e) = root_store.add(&rustls::Certificate(cert.0)) {
                debug!("Skipping unusable native certificate: {}", e);
            }
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self::with_config(Arc::new(config)))
    }

    pub fn with_config(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }
}

#[async_trait]
impl Check for TlsHandshakeCheck {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn check(&self, connect: &ConnectRequest, backend: &BackendUri) -> anyhow::Result<()> {
        let server_name = ServerName::try_from(connect.target_host())
            .map_err(|_| anyhow!("invalid server name {:?}", connect.target_host()))?;

        let conn = BackendTransport::connect(connect, backend)
            .await
            .context("auxiliary CONNECT failed")?;

        match self.connector.connect(server_name, conn.stream).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_tls(&e) => {
                debug!(to = %connect.target(), "Target does not speak TLS, skipping");
                Ok(())
            }
            Err(e) => Err(anyhow!(e).context("TLS handshake failed")),
        }
    }
}

/// Whether a handshake error means the peer sent something that is not a TLS
/// record at all
fn is_not_tls(err: &std::io::Error) -> bool {
    let Some(inner) = err.get_ref() else {
        return false;
    };
    matches!(
        inner.downcast_ref::<rustls::Error>(),
        Some(rustls::Error::InvalidMessage(
            InvalidMessage::InvalidContentType
                | InvalidMessage::UnknownProtocolVersion
                | InvalidMessage::MessageTooLarge
        ))
    )
}
