use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use super::{cert_matches_host, hostname_matches_presented};

fn certificate_der(subject_alt_names: &[&str], common_name: Option<&str>) -> Vec<u8> {
    let names: Vec<String> = subject_alt_names.iter().map(|name| name.to_string()).collect();
    let mut params = CertificateParams::new(names).expect("certificate params");
    let mut distinguished_name = DistinguishedName::new();
    if let Some(common_name) = common_name {
        distinguished_name.push(DnType::CommonName, common_name);
    }
    params.distinguished_name = distinguished_name;
    let key = KeyPair::generate().expect("key pair");
    params.self_signed(&key).expect("self signed").der().to_vec()
}

#[test]
fn exact_san_matches_host_under_test() {
    let cert = certificate_der(&["api.example.com"], None);
    assert!(cert_matches_host(&cert, "api.example.com"));
}

#[test]
fn different_san_does_not_match() {
    let cert = certificate_der(&["www.example.com"], None);
    assert!(!cert_matches_host(&cert, "api.example.com"));
}

#[test]
fn wildcard_san_matches_single_left_most_label() {
    let cert = certificate_der(&["*.example.com"], None);
    assert!(cert_matches_host(&cert, "api.example.com"));
    assert!(!cert_matches_host(&cert, "example.com"));
    assert!(!cert_matches_host(&cert, "deep.api.example.com"));
}

#[test]
fn matching_ignores_case_and_trailing_dot() {
    let cert = certificate_der(&["API.Example.COM"], None);
    assert!(cert_matches_host(&cert, "api.example.com"));
    assert!(cert_matches_host(&cert, "api.example.com."));
}

#[test]
fn any_san_entry_can_match() {
    let cert = certificate_der(&["www.example.com", "api.example.com"], None);
    assert!(cert_matches_host(&cert, "api.example.com"));
}

#[test]
fn common_name_is_used_only_without_san() {
    let cn_only = certificate_der(&[], Some("api.example.com"));
    assert!(cert_matches_host(&cn_only, "api.example.com"));

    let san_and_cn = certificate_der(&["www.example.com"], Some("api.example.com"));
    assert!(
        !cert_matches_host(&san_and_cn, "api.example.com"),
        "a DNS subjectAltName must suppress the common name fallback"
    );
}

#[test]
fn ip_san_matches_ip_literal_reference() {
    let cert = certificate_der(&["127.0.0.1"], None);
    assert!(cert_matches_host(&cert, "127.0.0.1"));
    assert!(!cert_matches_host(&cert, "127.0.0.2"));
    assert!(!cert_matches_host(&cert, "localhost"));
}

#[test]
fn unparseable_certificate_never_matches() {
    assert!(!cert_matches_host(b"definitely not der", "api.example.com"));
}

#[test]
fn partial_wildcard_needs_at_least_one_character() {
    assert!(hostname_matches_presented("foo.example.com", "f*.example.com"));
    assert!(hostname_matches_presented("foobar.example.com", "f*r.example.com"));
    assert!(!hostname_matches_presented("f.example.com", "f*.example.com"));
}

#[test]
fn wildcard_outside_left_most_label_is_literal() {
    assert!(!hostname_matches_presented("api.foo.example.com", "api.*.example.com"));
    assert!(!hostname_matches_presented("api.example.com", "**.example.com"));
}

#[test]
fn wildcard_does_not_reach_into_idn_labels() {
    assert!(hostname_matches_presented("xn--bcher-kva.example.com", "*.example.com"));
    assert!(!hostname_matches_presented("xn--bcher-kva.example.com", "xn--*.example.com"));
}

#[test]
fn single_label_presented_name_needs_exact_match() {
    assert!(hostname_matches_presented("localhost", "localhost"));
    assert!(!hostname_matches_presented("localhost", "*"));
    assert!(!hostname_matches_presented("api.example.com", ""));
}

#[test]
fn non_ascii_presented_name_never_matches() {
    assert!(!hostname_matches_presented("bücher.example.com", "bücher.example.com"));
}

#[test]
fn non_ascii_reference_name_never_matches_wildcard() {
    assert!(!hostname_matches_presented("\u{fc}.example.com", "*.example.com"));
    assert!(!hostname_matches_presented("bücher.example.com", "*.example.com"));
    assert!(hostname_matches_presented("xn--bcher-kva.example.com", "*.example.com"));
}
