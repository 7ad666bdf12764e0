use pretense_tls::TlsConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("test {test_id} has malformed certificate material: {source}")]
    MalformedTest {
        test_id: String,
        #[source]
        source: TlsConfigError,
    },
    #[error("reporting result for test {test_id} failed: {source}")]
    Report {
        test_id: String,
        #[source]
        source: CoordinatorError,
    },
    #[error("coordinator unavailable: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("interception engine failed: {0}")]
    Engine(#[from] EngineError),
    #[error("TLS material error: {0}")]
    Tls(#[from] TlsConfigError),
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),
    #[error("coordinator is not paused but has no current test")]
    NoCurrentTest,
    #[error("coordinator state lock poisoned")]
    LockPoisoned,
}

/// Failures inside the interception engine's own certificate lookup. The
/// harness passes these through without rewriting them.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("certificate lookup failed: {0}")]
    Certificate(#[from] TlsConfigError),
    #[error("upstream certificate fetch failed: {0}")]
    Upstream(String),
    #[error("timed out during {stage}")]
    Timeout { stage: &'static str },
}
