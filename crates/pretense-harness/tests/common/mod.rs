#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use pretense_harness::{
    CertificateContext, ConnectionInfo, Destination, FallbackAuthority, FallbackAuthorityConfig,
    RecordingCoordinator, TestCase, TestChain, TestingMethod,
};

pub const HOST_UNDER_TEST: &str = "api.example.com";

pub fn trusted_authority() -> Arc<FallbackAuthority> {
    Arc::new(FallbackAuthority::new(FallbackAuthorityConfig::default()).expect("trusted authority"))
}

pub fn untrusted_authority() -> FallbackAuthority {
    FallbackAuthority::new(FallbackAuthorityConfig {
        ca_common_name: "pretense Untrusted Test CA".to_string(),
        ..FallbackAuthorityConfig::default()
    })
    .expect("untrusted authority")
}

/// A chain for `host` issued by `authority`, as a test would configure it.
pub fn chain_from(authority: &FallbackAuthority, host: &str) -> TestChain {
    let context = authority.issue_for_host(host).expect("issue test leaf");
    TestChain::new(context.presented_chain(), context.leaf_key.clone_key()).expect("test chain")
}

pub fn untrusted_chain(host: &str) -> TestChain {
    chain_from(&untrusted_authority(), host)
}

pub fn coordinator_with_test(
    authority: Arc<FallbackAuthority>,
    test_id: &str,
    chain: &TestChain,
    method: TestingMethod,
) -> Arc<RecordingCoordinator> {
    let coordinator = Arc::new(RecordingCoordinator::new(authority));
    coordinator
        .set_current_test(TestCase::from_chain(test_id, HOST_UNDER_TEST, chain), method)
        .expect("set current test");
    coordinator
}

pub fn connection_to(host: &str) -> ConnectionInfo {
    ConnectionInfo::new(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 52431),
        Destination::new(host, 443),
    )
}

/// What the engine's default lookup would present for `host`.
pub fn fallback_context(authority: &FallbackAuthority, host: &str) -> CertificateContext {
    authority.issue_for_host(host).expect("fallback context")
}
