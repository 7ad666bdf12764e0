use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use x509_parser::parse_x509_certificate;

use crate::identity::cert_matches_host;
use crate::TlsConfigError;

/// Certificate material an interception engine is about to present on one
/// connection. Fields are public so observers can rewrite them in place.
pub struct CertificateContext {
    pub leaf_certificate: CertificateDer<'static>,
    pub leaf_key: PrivateKeyDer<'static>,
    pub extra_chain: Vec<CertificateDer<'static>>,
}

impl CertificateContext {
    pub fn new(
        leaf_certificate: CertificateDer<'static>,
        leaf_key: PrivateKeyDer<'static>,
        extra_chain: Vec<CertificateDer<'static>>,
    ) -> Self {
        Self {
            leaf_certificate,
            leaf_key,
            extra_chain,
        }
    }

    pub fn matches_host(&self, hostname: &str) -> bool {
        cert_matches_host(self.leaf_certificate.as_ref(), hostname)
    }

    /// Leaf first, then the extra chain in order.
    pub fn presented_chain(&self) -> Vec<CertificateDer<'static>> {
        let mut chain = Vec::with_capacity(1 + self.extra_chain.len());
        chain.push(self.leaf_certificate.clone());
        chain.extend(self.extra_chain.iter().cloned());
        chain
    }

    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsConfigError> {
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.presented_chain(), self.leaf_key.clone_key())?;
        Ok(Arc::new(server_config))
    }
}

impl Clone for CertificateContext {
    fn clone(&self) -> Self {
        Self {
            leaf_certificate: self.leaf_certificate.clone(),
            leaf_key: self.leaf_key.clone_key(),
            extra_chain: self.extra_chain.clone(),
        }
    }
}

impl fmt::Debug for CertificateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateContext")
            .field("leaf_certificate_len", &self.leaf_certificate.as_ref().len())
            .field("extra_chain_len", &self.extra_chain.len())
            .finish_non_exhaustive()
    }
}

/// A validated certificate chain and leaf key configured by a test.
pub struct TestChain {
    leaf_certificate: CertificateDer<'static>,
    leaf_key: PrivateKeyDer<'static>,
    extra_chain: Vec<CertificateDer<'static>>,
}

impl TestChain {
    /// `chain[0]` is the leaf; the remainder is sent as the extra chain.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        leaf_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsConfigError> {
        let mut chain = chain.into_iter();
        let Some(leaf_certificate) = chain.next() else {
            return Err(TlsConfigError::InvalidMaterial(
                "test certificate chain must contain a leaf certificate".to_string(),
            ));
        };
        let extra_chain: Vec<CertificateDer<'static>> = chain.collect();

        parse_x509_certificate(leaf_certificate.as_ref()).map_err(|error| {
            TlsConfigError::InvalidMaterial(format!("test leaf certificate does not parse: {error}"))
        })?;
        for (index, intermediate) in extra_chain.iter().enumerate() {
            parse_x509_certificate(intermediate.as_ref()).map_err(|error| {
                TlsConfigError::InvalidMaterial(format!(
                    "test chain certificate {} does not parse: {error}",
                    index + 1
                ))
            })?;
        }
        ensure_key_matches_leaf(&leaf_certificate, &leaf_key)?;

        Ok(Self {
            leaf_certificate,
            leaf_key,
            extra_chain,
        })
    }

    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsConfigError> {
        let chain = CertificateDer::pem_slice_iter(chain_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| {
                TlsConfigError::InvalidMaterial(format!(
                    "failed to parse test chain PEM: {error}"
                ))
            })?;
        let leaf_key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|error| {
            TlsConfigError::InvalidMaterial(format!("failed to parse test key PEM: {error}"))
        })?;
        Self::new(chain, leaf_key)
    }

    pub fn from_pem_files(
        chain_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TlsConfigError> {
        let chain_pem = fs::read(chain_path.as_ref())?;
        let key_pem = fs::read(key_path.as_ref())?;
        Self::from_pem(&chain_pem, &key_pem)
    }

    pub fn leaf_certificate(&self) -> &CertificateDer<'static> {
        &self.leaf_certificate
    }

    pub fn leaf_key(&self) -> &PrivateKeyDer<'static> {
        &self.leaf_key
    }

    pub fn extra_chain(&self) -> &[CertificateDer<'static>] {
        &self.extra_chain
    }

    /// Overwrites every certificate field of `context` with this chain.
    pub fn apply_to(&self, context: &mut CertificateContext) {
        context.leaf_certificate = self.leaf_certificate.clone();
        context.leaf_key = self.leaf_key.clone_key();
        context.extra_chain = self.extra_chain.clone();
    }
}

impl Clone for TestChain {
    fn clone(&self) -> Self {
        Self {
            leaf_certificate: self.leaf_certificate.clone(),
            leaf_key: self.leaf_key.clone_key(),
            extra_chain: self.extra_chain.clone(),
        }
    }
}

impl fmt::Debug for TestChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestChain")
            .field("leaf_certificate_len", &self.leaf_certificate.as_ref().len())
            .field("extra_chain_len", &self.extra_chain.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn ensure_key_matches_leaf(
    leaf_certificate: &CertificateDer<'static>,
    leaf_key: &PrivateKeyDer<'static>,
) -> Result<(), TlsConfigError> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(leaf_key).map_err(|error| {
        TlsConfigError::InvalidMaterial(format!("unsupported leaf private key: {error}"))
    })?;
    CertifiedKey::new(vec![leaf_certificate.clone()], signing_key)
        .keys_match()
        .map_err(|error| {
            TlsConfigError::InvalidMaterial(format!(
                "leaf private key does not match leaf certificate: {error}"
            ))
        })
}
