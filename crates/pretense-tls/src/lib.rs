use std::error::Error as StdError;
use std::fmt;

mod authority;
mod identity;
mod material;
mod upstream;

pub use authority::{AuthorityMetricsSnapshot, FallbackAuthority, FallbackAuthorityConfig};
pub use identity::{cert_matches_host, hostname_matches_presented};
pub use material::{CertificateContext, TestChain};
pub use upstream::build_certificate_fetch_client_config;

/// Why a client refused to finish a handshake with the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    UnknownCa,
    BadCertificate,
    CertValidation,
    HandshakeAlert,
    Timeout,
    EofOrReset,
    NotTls,
    Other,
}

impl RejectionReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::UnknownCa => "unknown_ca",
            Self::BadCertificate => "bad_certificate",
            Self::CertValidation => "cert_validation",
            Self::HandshakeAlert => "handshake",
            Self::Timeout => "timeout",
            Self::EofOrReset => "eof_or_reset",
            Self::NotTls => "not_tls",
            Self::Other => "other",
        }
    }
}

pub fn classify_rejection(error_text: &str) -> RejectionReason {
    let lower = error_text.to_ascii_lowercase();

    if contains_any(
        &lower,
        &[
            "unknownca",
            "unknown ca",
            "unknown_ca",
            "unknown issuer",
            "unknownissuer",
            "self signed",
            "self-signed",
        ],
    ) {
        return RejectionReason::UnknownCa;
    }
    if contains_any(
        &lower,
        &[
            "badcertificate",
            "bad certificate",
            "bad_certificate",
            "unsupportedcertificate",
            "certificateunknown",
            "certificate unknown",
        ],
    ) {
        return RejectionReason::BadCertificate;
    }
    if contains_any(
        &lower,
        &[
            "certificateexpired",
            "certificate expired",
            "certificaterevoked",
            "hostname mismatch",
            "name mismatch",
            "notvalidforname",
            "expired",
        ],
    ) {
        return RejectionReason::CertValidation;
    }
    if contains_any(&lower, &["timed out", "timeout", "deadline has elapsed"]) {
        return RejectionReason::Timeout;
    }
    if contains_any(
        &lower,
        &[
            "unexpected eof",
            "early eof",
            "connection reset",
            "broken pipe",
            "connection aborted",
        ],
    ) {
        return RejectionReason::EofOrReset;
    }
    if contains_any(
        &lower,
        &[
            "invalidcontenttype",
            "invalid content type",
            "corrupt message",
            "invalidmessage",
            "not a tls handshake",
        ],
    ) {
        return RejectionReason::NotTls;
    }
    if contains_any(
        &lower,
        &[
            "handshake",
            "alert",
            "protocol version",
            "decrypt error",
            "insufficient security",
        ],
    ) {
        return RejectionReason::HandshakeAlert;
    }

    RejectionReason::Other
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[derive(Debug)]
pub enum TlsConfigError {
    CertificateGeneration(rcgen::Error),
    ConfigBuild(rustls::Error),
    Io(std::io::Error),
    LockPoisoned,
    InvalidConfiguration(String),
    InvalidMaterial(String),
}

impl fmt::Display for TlsConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CertificateGeneration(error) => {
                write!(f, "certificate generation failed: {error}")
            }
            Self::ConfigBuild(error) => write!(f, "TLS config build failed: {error}"),
            Self::Io(error) => write!(f, "I/O error: {error}"),
            Self::LockPoisoned => write!(f, "fallback authority lock poisoned"),
            Self::InvalidConfiguration(reason) => write!(f, "invalid TLS configuration: {reason}"),
            Self::InvalidMaterial(reason) => write!(f, "invalid certificate material: {reason}"),
        }
    }
}

impl StdError for TlsConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::CertificateGeneration(error) => Some(error),
            Self::ConfigBuild(error) => Some(error),
            Self::Io(error) => Some(error),
            Self::LockPoisoned | Self::InvalidConfiguration(_) | Self::InvalidMaterial(_) => None,
        }
    }
}

impl From<rcgen::Error> for TlsConfigError {
    fn from(value: rcgen::Error) -> Self {
        Self::CertificateGeneration(value)
    }
}

impl From<rustls::Error> for TlsConfigError {
    fn from(value: rustls::Error) -> Self {
        Self::ConfigBuild(value)
    }
}

impl From<std::io::Error> for TlsConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[cfg(test)]
mod tests_authority;
#[cfg(test)]
mod tests_identity;
#[cfg(test)]
mod tests_rejection;
