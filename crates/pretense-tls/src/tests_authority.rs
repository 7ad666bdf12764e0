use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use super::{
    AuthorityMetricsSnapshot, FallbackAuthority, FallbackAuthorityConfig, TestChain,
    TlsConfigError,
};

#[test]
fn issued_leaf_covers_dns_host_and_chains_to_ca() {
    let authority = FallbackAuthority::new(FallbackAuthorityConfig::default()).expect("authority");

    let context = authority
        .issue_for_host("API.Example.com")
        .expect("domain leaf");
    assert_leaf_dns_name(&context.leaf_certificate, "api.example.com");
    assert_leaf_common_name(&context.leaf_certificate, "api.example.com");
    assert_leaf_issuer_common_name(&context.leaf_certificate, "pretense Trusted Test CA");
    assert_eq!(context.extra_chain, vec![authority.ca_certificate_der().clone()]);
    assert!(context.matches_host("api.example.com"));
}

#[test]
fn issued_leaf_for_ip_destination_uses_ip_san() {
    let authority = FallbackAuthority::new(FallbackAuthorityConfig::default()).expect("authority");
    let context = authority.issue_for_host("127.0.0.1").expect("ip leaf");
    assert_leaf_ip(&context.leaf_certificate, [127, 0, 0, 1]);
    assert_leaf_common_name(&context.leaf_certificate, "127.0.0.1");
    assert!(!context.matches_host("api.example.com"));
}

#[test]
fn leaf_cache_reports_hits_and_misses() {
    let authority = FallbackAuthority::new(FallbackAuthorityConfig::default()).expect("authority");

    let first = authority.issue_for_host("api.example.com").expect("first");
    let second = authority.issue_for_host("api.example.com").expect("second");
    assert_eq!(first.leaf_certificate, second.leaf_certificate);

    assert_eq!(
        authority.metrics_snapshot(),
        AuthorityMetricsSnapshot {
            cache_hits: 1,
            cache_misses: 1,
            leaves_issued: 1,
            leaves_resigned: 0,
        }
    );
}

#[test]
fn zero_capacity_cache_issues_every_time() {
    let config = FallbackAuthorityConfig {
        leaf_cache_capacity: 0,
        ..FallbackAuthorityConfig::default()
    };
    let authority = FallbackAuthority::new(config).expect("authority");

    let first = authority.issue_for_host("api.example.com").expect("first");
    let second = authority.issue_for_host("api.example.com").expect("second");
    assert_ne!(first.leaf_certificate, second.leaf_certificate);

    let metrics = authority.metrics_snapshot();
    assert_eq!(metrics.cache_hits, 0);
    assert_eq!(metrics.cache_misses, 2);
    assert_eq!(metrics.leaves_issued, 2);
}

#[test]
fn cache_evicts_least_recently_used_host() {
    let config = FallbackAuthorityConfig {
        leaf_cache_capacity: 1,
        ..FallbackAuthorityConfig::default()
    };
    let authority = FallbackAuthority::new(config).expect("authority");

    authority.issue_for_host("a.example.com").expect("a");
    authority.issue_for_host("b.example.com").expect("b");
    authority.issue_for_host("a.example.com").expect("a again");
    assert_eq!(authority.metrics_snapshot().cache_hits, 0);
    assert_eq!(authority.metrics_snapshot().leaves_issued, 3);
}

#[test]
fn resign_keeps_genuine_identity_and_swaps_issuer() {
    let authority = FallbackAuthority::new(FallbackAuthorityConfig::default()).expect("authority");
    let genuine = genuine_certificate(&["www.example.com", "*.cdn.example.com"], "www.example.com");

    let context = authority.resign(&genuine).expect("resign");
    assert_leaf_common_name(&context.leaf_certificate, "www.example.com");
    assert_leaf_dns_name(&context.leaf_certificate, "www.example.com");
    assert_leaf_dns_name(&context.leaf_certificate, "*.cdn.example.com");
    assert_leaf_issuer_common_name(&context.leaf_certificate, "pretense Trusted Test CA");
    assert!(context.matches_host("img.cdn.example.com"));
    assert_eq!(authority.metrics_snapshot().leaves_resigned, 1);
}

#[test]
fn resign_rejects_unparseable_certificate() {
    let authority = FallbackAuthority::new(FallbackAuthorityConfig::default()).expect("authority");
    let error = match authority.resign(b"not a certificate") {
        Ok(_) => panic!("garbage must not re-sign"),
        Err(error) => error,
    };
    assert!(matches!(error, TlsConfigError::InvalidMaterial(_)), "{error}");
}

#[test]
fn authority_loads_existing_ca_from_disk() {
    let temp_dir = unique_temp_dir("pretense-ca-load");
    fs::create_dir_all(&temp_dir).expect("create temp dir");
    let config = FallbackAuthorityConfig {
        ca_cert_pem_path: Some(path_to_string(&temp_dir.join("ca-cert.pem"))),
        ca_key_pem_path: Some(path_to_string(&temp_dir.join("ca-key.pem"))),
        ..FallbackAuthorityConfig::default()
    };

    let first = FallbackAuthority::new(config.clone()).expect("first authority");
    let first_ca = first.ca_certificate_pem().to_string();
    drop(first);

    let second = FallbackAuthority::new(config).expect("second authority");
    assert_eq!(first_ca, second.ca_certificate_pem());

    fs::remove_dir_all(&temp_dir).expect("cleanup temp dir");
}

#[test]
fn authority_rejects_mismatched_ca_key() {
    let first = FallbackAuthority::new(FallbackAuthorityConfig::default()).expect("first");
    let second = FallbackAuthority::new(FallbackAuthorityConfig::default()).expect("second");

    let error = match FallbackAuthority::from_pem(
        first.ca_certificate_pem(),
        second.ca_key_pem(),
        FallbackAuthorityConfig::default(),
    ) {
        Ok(_) => panic!("mismatched CA material unexpectedly loaded"),
        Err(error) => error,
    };
    assert!(error.to_string().contains("inconsistent"), "{error}");
}

#[test]
fn authority_rejects_partial_ca_path_configuration() {
    let config = FallbackAuthorityConfig {
        ca_cert_pem_path: Some("/tmp/pretense-only-cert.pem".to_string()),
        ca_key_pem_path: None,
        ..FallbackAuthorityConfig::default()
    };
    let error = match FallbackAuthority::new(config) {
        Ok(_) => panic!("partial CA path configuration unexpectedly succeeded"),
        Err(error) => error,
    };
    assert!(
        error
            .to_string()
            .contains("must either both be set or both be unset"),
        "{error}"
    );
}

#[test]
fn test_chain_from_pem_splits_leaf_and_extra_chain() {
    let (chain_pem, key_pem, intermediate_der) = pem_test_chain("api.example.com");
    let chain = TestChain::from_pem(chain_pem.as_bytes(), key_pem.as_bytes()).expect("chain");
    assert_eq!(chain.extra_chain(), &[intermediate_der]);

    let authority = FallbackAuthority::new(FallbackAuthorityConfig::default()).expect("authority");
    let mut context = authority.issue_for_host("api.example.com").expect("leaf");
    chain.apply_to(&mut context);
    assert_eq!(&context.leaf_certificate, chain.leaf_certificate());
    assert_eq!(context.presented_chain().len(), 2);
    context.server_config().expect("server config from test chain");
}

#[test]
fn test_chain_rejects_empty_chain() {
    let key = KeyPair::generate().expect("key");
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let error = TestChain::new(Vec::new(), key_der).expect_err("empty chain must fail");
    assert!(error.to_string().contains("must contain a leaf"), "{error}");
}

#[test]
fn test_chain_rejects_key_that_does_not_match_leaf() {
    let leaf = genuine_certificate(&["api.example.com"], "api.example.com");
    let other_key = KeyPair::generate().expect("key");
    let other_key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(other_key.serialize_der()));

    let error = TestChain::new(vec![CertificateDer::from(leaf)], other_key_der)
        .expect_err("mismatched key must fail");
    assert!(error.to_string().contains("does not match"), "{error}");
}

#[test]
fn test_chain_rejects_garbage_pem() {
    let error = TestChain::from_pem(b"-----BEGIN CERTIFICATE-----\nnope\n", b"")
        .expect_err("garbage PEM must fail");
    assert!(matches!(error, TlsConfigError::InvalidMaterial(_)), "{error}");
}

fn genuine_certificate(subject_alt_names: &[&str], common_name: &str) -> Vec<u8> {
    let names: Vec<String> = subject_alt_names.iter().map(|name| name.to_string()).collect();
    let mut params = CertificateParams::new(names).expect("params");
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    params.distinguished_name = distinguished_name;
    let key = KeyPair::generate().expect("key");
    params.self_signed(&key).expect("self signed").der().to_vec()
}

fn pem_test_chain(host: &str) -> (String, String, CertificateDer<'static>) {
    let intermediate_key = KeyPair::generate().expect("intermediate key");
    let mut intermediate_params = CertificateParams::default();
    intermediate_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let mut intermediate_name = DistinguishedName::new();
    intermediate_name.push(DnType::CommonName, "pretense Untrusted Intermediate");
    intermediate_params.distinguished_name = intermediate_name;
    let intermediate = intermediate_params
        .self_signed(&intermediate_key)
        .expect("intermediate cert");
    let issuer = Issuer::new(intermediate_params, intermediate_key);

    let leaf_key = KeyPair::generate().expect("leaf key");
    let leaf = CertificateParams::new(vec![host.to_string()])
        .expect("leaf params")
        .signed_by(&leaf_key, &issuer)
        .expect("leaf cert");

    (
        format!("{}{}", leaf.pem(), intermediate.pem()),
        leaf_key.serialize_pem(),
        intermediate.der().clone(),
    )
}

fn assert_leaf_common_name(cert_der: &CertificateDer<'static>, expected: &str) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .expect("commonName")
        .as_str()
        .expect("commonName as utf8");
    assert_eq!(cn, expected);
}

fn assert_leaf_issuer_common_name(cert_der: &CertificateDer<'static>, expected: &str) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let cn = cert
        .issuer()
        .iter_common_name()
        .next()
        .expect("issuer commonName")
        .as_str()
        .expect("issuer commonName as utf8");
    assert_eq!(cn, expected);
}

fn assert_leaf_dns_name(cert_der: &CertificateDer<'static>, expected: &str) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let san = cert
        .subject_alternative_name()
        .expect("san extension parse")
        .expect("san extension present");
    let found = san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::DNSName(value) if *value == expected));
    assert!(found, "expected SAN DNSName {expected}");
}

fn assert_leaf_ip(cert_der: &CertificateDer<'static>, expected: [u8; 4]) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let san = cert
        .subject_alternative_name()
        .expect("san extension parse")
        .expect("san extension present");
    let found = san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == expected));
    assert!(found, "expected SAN IPAddress {expected:?}");
}

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock");
    std::env::temp_dir().join(format!(
        "{prefix}-{}-{}",
        std::process::id(),
        now.as_nanos()
    ))
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
