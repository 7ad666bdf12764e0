use std::sync::Arc;
use std::time::Duration;

use pretense_tls::{build_certificate_fetch_client_config, CertificateContext, FallbackAuthority};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::destination::Destination;
use crate::engine::CertificateSource;
use crate::errors::EngineError;

/// Issues a fresh CA-signed leaf naming the destination. Never touches the
/// network.
#[derive(Debug, Clone, Copy, Default)]
pub struct MintingCertificateSource;

impl CertificateSource for MintingCertificateSource {
    async fn initial_context(
        &self,
        authority: &FallbackAuthority,
        destination: &Destination,
    ) -> Result<CertificateContext, EngineError> {
        Ok(authority.issue_for_host(&destination.host)?)
    }

    async fn sni_context(
        &self,
        authority: &FallbackAuthority,
        _destination: &Destination,
        server_name: &str,
    ) -> Result<CertificateContext, EngineError> {
        Ok(authority.issue_for_host(server_name)?)
    }
}

/// Fetches the genuine certificate from the real destination and re-signs it
/// with the fallback authority.
#[derive(Debug, Clone)]
pub struct UpstreamResigningSource {
    upstream: Option<String>,
    connect_timeout: Duration,
    client_config: Arc<ClientConfig>,
}

impl UpstreamResigningSource {
    /// `upstream` overrides where the genuine certificate is fetched from;
    /// by default the connection's original destination is dialed.
    pub fn new(upstream: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            upstream,
            connect_timeout,
            client_config: build_certificate_fetch_client_config(),
        }
    }

    async fn fetch_genuine_leaf(
        &self,
        destination: &Destination,
        server_name: &str,
    ) -> Result<CertificateDer<'static>, EngineError> {
        let server_name = ServerName::try_from(server_name.to_string()).map_err(|error| {
            EngineError::Upstream(format!("invalid upstream server name '{server_name}': {error}"))
        })?;
        let target = self
            .upstream
            .clone()
            .unwrap_or_else(|| destination.socket_target());

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| EngineError::Timeout {
                stage: "upstream connect",
            })?
            .map_err(|error| EngineError::Upstream(format!("connect {target} failed: {error}")))?;

        let connector = TlsConnector::from(Arc::clone(&self.client_config));
        let mut tls = tokio::time::timeout(self.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| EngineError::Timeout {
                stage: "upstream handshake",
            })?
            .map_err(|error| {
                EngineError::Upstream(format!("upstream handshake with {target} failed: {error}"))
            })?;

        let leaf = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .cloned()
            .ok_or_else(|| {
                EngineError::Upstream(format!("{target} presented no certificate"))
            })?;
        if let Err(error) = tls.shutdown().await {
            tracing::debug!(%target, %error, "upstream shutdown after certificate fetch failed");
        }
        Ok(leaf)
    }
}

impl CertificateSource for UpstreamResigningSource {
    async fn initial_context(
        &self,
        authority: &FallbackAuthority,
        destination: &Destination,
    ) -> Result<CertificateContext, EngineError> {
        let leaf = self.fetch_genuine_leaf(destination, &destination.host).await?;
        Ok(authority.resign(leaf.as_ref())?)
    }

    async fn sni_context(
        &self,
        authority: &FallbackAuthority,
        destination: &Destination,
        server_name: &str,
    ) -> Result<CertificateContext, EngineError> {
        let leaf = self.fetch_genuine_leaf(destination, server_name).await?;
        Ok(authority.resign(leaf.as_ref())?)
    }
}
