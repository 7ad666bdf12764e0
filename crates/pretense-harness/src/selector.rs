use pretense_tls::{CertificateContext, TestChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub substitute: bool,
}

/// Substitutes the test chain into `candidate` when the candidate's identity
/// covers `host_to_test`. A non-matching candidate is left untouched.
pub fn select(
    candidate: &mut CertificateContext,
    host_to_test: &str,
    chain: &TestChain,
) -> Decision {
    if !candidate.matches_host(host_to_test) {
        return Decision { substitute: false };
    }
    chain.apply_to(candidate);
    Decision { substitute: true }
}
