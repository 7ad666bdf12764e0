use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use pretense_tls::{FallbackAuthority, TestChain};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::{CoordinatorError, HarnessError};

/// Which lifecycle event finalizes a tested connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestingMethod {
    TlsHandshake,
    SendData,
}

impl TestingMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TlsHandshake => "tls_handshake",
            Self::SendData => "send_data",
        }
    }
}

impl fmt::Display for TestingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestingMethod {
    type Err = HarnessError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tls_handshake" | "tlshandshake" => Ok(Self::TlsHandshake),
            "send_data" | "senddata" => Ok(Self::SendData),
            other => Err(HarnessError::InvalidConfig(format!(
                "testing_method must be tls_handshake or send_data, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Running,
    Connected,
    Rejected,
    SentData,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Connected => "connected",
            Self::Rejected => "rejected",
            Self::SentData => "sent_data",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub test_id: String,
    pub status: TestStatus,
}

/// The coordinator's current test, as handed out before validation.
pub struct TestCase {
    pub id: String,
    pub host_to_test: String,
    /// Leaf first, then the extra chain in presentation order.
    pub certificate_chain: Vec<CertificateDer<'static>>,
    pub leaf_key: PrivateKeyDer<'static>,
}

impl TestCase {
    pub fn new(
        id: impl Into<String>,
        host_to_test: impl Into<String>,
        certificate_chain: Vec<CertificateDer<'static>>,
        leaf_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            id: id.into(),
            host_to_test: host_to_test.into(),
            certificate_chain,
            leaf_key,
        }
    }

    pub fn from_chain(
        id: impl Into<String>,
        host_to_test: impl Into<String>,
        chain: &TestChain,
    ) -> Self {
        let mut certificate_chain = Vec::with_capacity(1 + chain.extra_chain().len());
        certificate_chain.push(chain.leaf_certificate().clone());
        certificate_chain.extend(chain.extra_chain().iter().cloned());
        Self::new(id, host_to_test, certificate_chain, chain.leaf_key().clone_key())
    }

    /// Validates the material, attributing any failure to this test.
    pub fn validated_chain(&self) -> Result<TestChain, HarnessError> {
        if self.host_to_test.trim().is_empty() {
            return Err(HarnessError::MalformedTest {
                test_id: self.id.clone(),
                source: pretense_tls::TlsConfigError::InvalidMaterial(
                    "host_to_test must not be empty".to_string(),
                ),
            });
        }
        TestChain::new(self.certificate_chain.clone(), self.leaf_key.clone_key()).map_err(
            |source| HarnessError::MalformedTest {
                test_id: self.id.clone(),
                source,
            },
        )
    }
}

impl Clone for TestCase {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            host_to_test: self.host_to_test.clone(),
            certificate_chain: self.certificate_chain.clone(),
            leaf_key: self.leaf_key.clone_key(),
        }
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("id", &self.id)
            .field("host_to_test", &self.host_to_test)
            .field("chain_len", &self.certificate_chain.len())
            .finish_non_exhaustive()
    }
}

/// One consistent read of the coordinator taken when a connection is accepted.
#[derive(Debug, Clone)]
pub enum Capture {
    Paused,
    Active {
        test: TestCase,
        method: TestingMethod,
    },
}

pub trait TestCoordinator: Send + Sync + 'static {
    fn paused(&self) -> bool;

    fn current_test(&self) -> Result<TestCase, CoordinatorError>;

    fn testing_method(&self) -> TestingMethod;

    fn fallback_authority(&self) -> Arc<FallbackAuthority>;

    /// Receives the single report owed by a tested connection. Duplicate
    /// reports for one test id across connections are the coordinator's to
    /// collapse.
    fn test_completed(&self, test_id: &str, status: TestStatus) -> Result<(), CoordinatorError>;

    /// Implementations whose state can change between the three reads below
    /// should override this with a single locked read. `paused` and
    /// `testing_method` cannot fail, so an implementation that hides an
    /// unreadable state behind them must surface it here instead.
    fn capture(&self) -> Result<Capture, CoordinatorError> {
        if self.paused() {
            return Ok(Capture::Paused);
        }
        Ok(Capture::Active {
            test: self.current_test()?,
            method: self.testing_method(),
        })
    }
}

const REPORT_CHANNEL_CAPACITY: usize = 64;

/// In-process coordinator holding one current test and recording reports.
pub struct RecordingCoordinator {
    authority: Arc<FallbackAuthority>,
    state: Mutex<RecordingState>,
    report_tx: broadcast::Sender<TestReport>,
}

struct RecordingState {
    paused: bool,
    closed: bool,
    current_test: Option<TestCase>,
    testing_method: TestingMethod,
    reported_ids: HashSet<String>,
    reports: Vec<TestReport>,
}

impl RecordingCoordinator {
    /// Starts paused with no current test.
    pub fn new(authority: Arc<FallbackAuthority>) -> Self {
        let (report_tx, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            authority,
            state: Mutex::new(RecordingState {
                paused: true,
                closed: false,
                current_test: None,
                testing_method: TestingMethod::TlsHandshake,
                reported_ids: HashSet::new(),
                reports: Vec::new(),
            }),
            report_tx,
        }
    }

    /// Replaces the current test and un-pauses.
    pub fn set_current_test(
        &self,
        test: TestCase,
        method: TestingMethod,
    ) -> Result<(), CoordinatorError> {
        let mut state = self.lock_state()?;
        tracing::info!(
            test_id = %test.id,
            host_to_test = %test.host_to_test,
            testing_method = %method,
            "current test changed"
        );
        state.current_test = Some(test);
        state.testing_method = method;
        state.paused = false;
        Ok(())
    }

    pub fn pause(&self) -> Result<(), CoordinatorError> {
        self.lock_state()?.paused = true;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), CoordinatorError> {
        self.lock_state()?.paused = false;
        Ok(())
    }

    /// After closing, reports are refused with `Unavailable`.
    pub fn close(&self) -> Result<(), CoordinatorError> {
        self.lock_state()?.closed = true;
        Ok(())
    }

    pub fn reports(&self) -> Result<Vec<TestReport>, CoordinatorError> {
        Ok(self.lock_state()?.reports.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TestReport> {
        self.report_tx.subscribe()
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, RecordingState>, CoordinatorError> {
        self.state.lock().map_err(|_| CoordinatorError::LockPoisoned)
    }
}

impl TestCoordinator for RecordingCoordinator {
    fn paused(&self) -> bool {
        match self.lock_state() {
            Ok(state) => state.paused,
            Err(error) => {
                tracing::warn!(%error, "treating coordinator as paused");
                true
            }
        }
    }

    fn current_test(&self) -> Result<TestCase, CoordinatorError> {
        self.lock_state()?
            .current_test
            .clone()
            .ok_or(CoordinatorError::NoCurrentTest)
    }

    fn testing_method(&self) -> TestingMethod {
        match self.lock_state() {
            Ok(state) => state.testing_method,
            Err(error) => {
                tracing::warn!(%error, "falling back to tls_handshake testing method");
                TestingMethod::TlsHandshake
            }
        }
    }

    fn fallback_authority(&self) -> Arc<FallbackAuthority> {
        Arc::clone(&self.authority)
    }

    fn test_completed(&self, test_id: &str, status: TestStatus) -> Result<(), CoordinatorError> {
        let mut state = self.lock_state()?;
        if state.closed {
            return Err(CoordinatorError::Unavailable(
                "coordinator closed before the report arrived".to_string(),
            ));
        }
        if !state.reported_ids.insert(test_id.to_string()) {
            tracing::debug!(test_id, %status, "ignoring duplicate report for completed test");
            return Ok(());
        }

        let report = TestReport {
            test_id: test_id.to_string(),
            status,
        };
        state.reports.push(report.clone());
        drop(state);

        tracing::info!(test_id, %status, "test completed");
        let _ = self.report_tx.send(report);
        Ok(())
    }

    fn capture(&self) -> Result<Capture, CoordinatorError> {
        let state = self.lock_state()?;
        if state.paused {
            return Ok(Capture::Paused);
        }
        let test = state
            .current_test
            .clone()
            .ok_or(CoordinatorError::NoCurrentTest)?;
        Ok(Capture::Active {
            test,
            method: state.testing_method,
        })
    }
}
