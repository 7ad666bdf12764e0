use std::sync::Arc;

use pretense_tls::{classify_rejection, CertificateContext, FallbackAuthority, TestChain};

use crate::coordinator::{Capture, TestCoordinator, TestReport, TestStatus, TestingMethod};
use crate::engine::{CertificateContextObserver, ConnectionLifecycleObserver};
use crate::errors::HarnessError;
use crate::outcome::OutcomeMachine;
use crate::selector::select;
use crate::types::ConnectionInfo;

/// Per-connection harness state plugged into an interception engine.
pub struct TestListener<C: TestCoordinator> {
    coordinator: Arc<C>,
    authority: Arc<FallbackAuthority>,
    connection: ConnectionInfo,
    mode: ListenerMode,
}

enum ListenerMode {
    /// Accepted while the coordinator was paused: pure pass-through.
    Paused,
    Testing(Box<ActiveTest>),
}

struct ActiveTest {
    test_id: String,
    host_to_test: String,
    chain: TestChain,
    machine: OutcomeMachine,
}

impl<C: TestCoordinator> TestListener<C> {
    /// Snapshots the coordinator's current test. Later changes to the
    /// coordinator never reach this connection.
    pub fn new(coordinator: Arc<C>, connection: ConnectionInfo) -> Result<Self, HarnessError> {
        let authority = coordinator.fallback_authority();
        let mode = match coordinator.capture()? {
            Capture::Paused => {
                tracing::debug!(
                    connection_id = %connection.connection_id,
                    peer = %connection.peer_addr,
                    "coordinator paused; connection passes through"
                );
                ListenerMode::Paused
            }
            Capture::Active { test, method } => {
                let chain = test.validated_chain()?;
                tracing::debug!(
                    connection_id = %connection.connection_id,
                    peer = %connection.peer_addr,
                    test_id = %test.id,
                    host_to_test = %test.host_to_test,
                    testing_method = %method,
                    "captured current test"
                );
                ListenerMode::Testing(Box::new(ActiveTest {
                    machine: OutcomeMachine::new(test.id.clone(), method),
                    test_id: test.id,
                    host_to_test: test.host_to_test,
                    chain,
                }))
            }
        };

        Ok(Self {
            coordinator,
            authority,
            connection,
            mode,
        })
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn fallback_authority(&self) -> &Arc<FallbackAuthority> {
        &self.authority
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.mode, ListenerMode::Paused)
    }

    /// True while test material is being presented and a report is owed.
    pub fn is_testing(&self) -> bool {
        match &self.mode {
            ListenerMode::Paused => false,
            ListenerMode::Testing(active) => active.machine.is_armed(),
        }
    }

    pub fn test_id(&self) -> Option<&str> {
        match &self.mode {
            ListenerMode::Paused => None,
            ListenerMode::Testing(active) => Some(&active.test_id),
        }
    }

    pub fn testing_method(&self) -> Option<TestingMethod> {
        match &self.mode {
            ListenerMode::Paused => None,
            ListenerMode::Testing(active) => Some(active.machine.method()),
        }
    }

    pub fn status(&self) -> Option<TestStatus> {
        match &self.mode {
            ListenerMode::Paused => None,
            ListenerMode::Testing(active) => Some(active.machine.status()),
        }
    }

    fn deliver(&self, report: Option<TestReport>) -> Result<(), HarnessError> {
        let Some(report) = report else {
            return Ok(());
        };
        tracing::info!(
            connection_id = %self.connection.connection_id,
            test_id = %report.test_id,
            status = %report.status,
            "reporting test outcome"
        );
        self.coordinator
            .test_completed(&report.test_id, report.status)
            .map_err(|source| HarnessError::Report {
                test_id: report.test_id,
                source,
            })
    }
}

impl<C: TestCoordinator> CertificateContextObserver for TestListener<C> {
    fn on_context_ready(&mut self, context: &mut CertificateContext) {
        let ListenerMode::Testing(active) = &mut self.mode else {
            return;
        };
        if select(context, &active.host_to_test, &active.chain).substitute {
            active.machine.arm();
            tracing::debug!(
                connection_id = %self.connection.connection_id,
                test_id = %active.test_id,
                "destination matches host under test; presenting test chain"
            );
        }
    }

    fn on_sni(&mut self, server_name: &str, context: &mut CertificateContext) {
        let ListenerMode::Testing(active) = &mut self.mode else {
            return;
        };
        if select(context, &active.host_to_test, &active.chain).substitute {
            active.machine.arm();
            tracing::debug!(
                connection_id = %self.connection.connection_id,
                test_id = %active.test_id,
                server_name,
                "SNI matches host under test; presenting test chain"
            );
        } else if active.machine.disarm().is_some() {
            tracing::warn!(
                connection_id = %self.connection.connection_id,
                test_id = %active.test_id,
                server_name,
                "SNI-resolved certificate does not match host under test; connection will not report"
            );
        }
    }
}

impl<C: TestCoordinator> ConnectionLifecycleObserver for TestListener<C> {
    fn on_handshake_success(&mut self) -> Result<(), HarnessError> {
        tracing::debug!(
            connection_id = %self.connection.connection_id,
            "client completed handshake"
        );
        let report = match &mut self.mode {
            ListenerMode::Paused => None,
            ListenerMode::Testing(active) => active.machine.on_handshake_success(),
        };
        self.deliver(report)
    }

    fn on_handshake_failure(&mut self, error: &str) -> Result<(), HarnessError> {
        let reason = classify_rejection(error);
        tracing::info!(
            connection_id = %self.connection.connection_id,
            reason = reason.code(),
            error,
            "client handshake failed"
        );
        let report = match &mut self.mode {
            ListenerMode::Paused => None,
            ListenerMode::Testing(active) => active.machine.on_handshake_failure(),
        };
        self.deliver(report)
    }

    fn on_data(&mut self, data: &[u8]) -> Result<(), HarnessError> {
        let report = match &mut self.mode {
            ListenerMode::Paused => None,
            ListenerMode::Testing(active) => active.machine.on_data(data),
        };
        self.deliver(report)
    }

    fn on_unbind(&mut self) -> Result<(), HarnessError> {
        tracing::debug!(
            connection_id = %self.connection.connection_id,
            "connection unbound"
        );
        let report = match &mut self.mode {
            ListenerMode::Paused => None,
            ListenerMode::Testing(active) => active.machine.on_unbind(),
        };
        self.deliver(report)
    }
}
