use std::future::Future;

use pretense_tls::{CertificateContext, FallbackAuthority};

use crate::destination::Destination;
use crate::errors::{EngineError, HarnessError};

/// Certificate decision points of an interception engine. The engine computes
/// its default context first and then lets the observer rewrite it.
pub trait CertificateContextObserver {
    /// Default context for the original destination, before SNI is known.
    fn on_context_ready(&mut self, context: &mut CertificateContext);

    /// Context re-derived after the client announced `server_name`.
    fn on_sni(&mut self, server_name: &str, context: &mut CertificateContext);
}

pub trait ConnectionLifecycleObserver {
    fn on_handshake_success(&mut self) -> Result<(), HarnessError>;

    fn on_handshake_failure(&mut self, error: &str) -> Result<(), HarnessError>;

    fn on_data(&mut self, data: &[u8]) -> Result<(), HarnessError>;

    /// Last callback of every connection, on every exit path.
    fn on_unbind(&mut self) -> Result<(), HarnessError>;
}

/// The engine's default certificate lookup, signed by the connection's
/// fallback authority.
pub trait CertificateSource: Send + Sync + 'static {
    fn initial_context(
        &self,
        authority: &FallbackAuthority,
        destination: &Destination,
    ) -> impl Future<Output = Result<CertificateContext, EngineError>> + Send;

    fn sni_context(
        &self,
        authority: &FallbackAuthority,
        destination: &Destination,
        server_name: &str,
    ) -> impl Future<Output = Result<CertificateContext, EngineError>> + Send;
}
