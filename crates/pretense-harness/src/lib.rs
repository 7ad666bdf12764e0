mod config;
mod coordinator;
mod destination;
mod engine;
mod errors;
mod listener;
mod outcome;
mod selector;
pub mod server;
mod source;
mod types;

pub use config::{HarnessConfig, SourceConfig, SourceKind, TimeoutConfig};
pub use coordinator::{
    Capture, RecordingCoordinator, TestCase, TestCoordinator, TestReport, TestStatus,
    TestingMethod,
};
pub use destination::Destination;
pub use engine::{CertificateContextObserver, CertificateSource, ConnectionLifecycleObserver};
pub use errors::{CoordinatorError, EngineError, HarnessError};
pub use listener::TestListener;
pub use outcome::{OutcomeMachine, ReportTicket};
pub use selector::{select, Decision};
pub use server::{
    run_test_listener_server, serve_test_connection, ServerOptions, ServerRunSummary,
};
pub use source::{MintingCertificateSource, UpstreamResigningSource};
pub use types::ConnectionInfo;

pub use pretense_tls::{
    CertificateContext, FallbackAuthority, FallbackAuthorityConfig, RejectionReason, TestChain,
};
