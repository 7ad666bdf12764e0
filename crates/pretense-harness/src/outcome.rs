use crate::coordinator::{TestReport, TestStatus, TestingMethod};

/// Proof that a connection still owes its coordinator a report. It is moved
/// into the report it produces, so a connection can report at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct ReportTicket {
    test_id: String,
}

impl ReportTicket {
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    fn redeem(self, status: TestStatus) -> TestReport {
        TestReport {
            test_id: self.test_id,
            status,
        }
    }
}

/// Per-connection outcome tracking for a captured test.
#[derive(Debug)]
pub struct OutcomeMachine {
    test_id: String,
    method: TestingMethod,
    status: TestStatus,
    ticket: Option<ReportTicket>,
    reported: bool,
}

impl OutcomeMachine {
    /// Starts unarmed in `running`.
    pub fn new(test_id: impl Into<String>, method: TestingMethod) -> Self {
        Self {
            test_id: test_id.into(),
            method,
            status: TestStatus::Running,
            ticket: None,
            reported: false,
        }
    }

    pub fn method(&self) -> TestingMethod {
        self.method
    }

    pub fn status(&self) -> TestStatus {
        self.status
    }

    pub fn is_armed(&self) -> bool {
        self.ticket.is_some()
    }

    pub fn has_reported(&self) -> bool {
        self.reported
    }

    /// Arms the machine after test material was substituted. A machine that
    /// already reported stays spent.
    pub fn arm(&mut self) {
        if self.reported || self.ticket.is_some() {
            return;
        }
        self.ticket = Some(ReportTicket {
            test_id: self.test_id.clone(),
        });
    }

    /// Withdraws an unspent ticket; the connection will not report.
    pub fn disarm(&mut self) -> Option<ReportTicket> {
        self.ticket.take()
    }

    pub fn on_handshake_success(&mut self) -> Option<TestReport> {
        if !self.is_armed() {
            return None;
        }
        self.status = TestStatus::Connected;
        if self.method == TestingMethod::TlsHandshake {
            return self.report();
        }
        None
    }

    pub fn on_handshake_failure(&mut self) -> Option<TestReport> {
        if !self.is_armed() {
            return None;
        }
        self.status = TestStatus::Rejected;
        self.report()
    }

    pub fn on_data(&mut self, data: &[u8]) -> Option<TestReport> {
        if !self.is_armed() || data.is_empty() {
            return None;
        }
        self.status = TestStatus::SentData;
        if self.method == TestingMethod::SendData {
            return self.report();
        }
        None
    }

    /// Reports the last recorded status if a report is still owed.
    pub fn on_unbind(&mut self) -> Option<TestReport> {
        self.report()
    }

    fn report(&mut self) -> Option<TestReport> {
        let ticket = self.ticket.take()?;
        self.reported = true;
        Some(ticket.redeem(self.status))
    }
}
