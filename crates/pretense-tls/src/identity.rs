use std::net::IpAddr;

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

/// Returns true when the DER certificate is valid for `hostname` under TLS
/// server-identity rules: DNS/IP subjectAltName entries when present, the
/// subject common name otherwise.
///
/// A certificate that cannot be parsed matches nothing.
pub fn cert_matches_host(cert_der: &[u8], hostname: &str) -> bool {
    let cert = match parse_x509_certificate(cert_der) {
        Ok((_, cert)) => cert,
        Err(error) => {
            tracing::debug!(%error, "candidate certificate did not parse; treating as no match");
            return false;
        }
    };
    certificate_identity_matches(&cert, hostname)
}

fn certificate_identity_matches(cert: &X509Certificate<'_>, hostname: &str) -> bool {
    let reference_ip = hostname.parse::<IpAddr>().ok();
    let mut has_identity_san = false;

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(presented) => {
                    has_identity_san = true;
                    if hostname_matches_presented(hostname, presented) {
                        return true;
                    }
                }
                GeneralName::IPAddress(presented) => {
                    has_identity_san = true;
                    if let Some(reference_ip) = reference_ip {
                        if ip_matches_presented(reference_ip, presented) {
                            return true;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if has_identity_san {
        return false;
    }

    cert.subject()
        .iter_common_name()
        .filter_map(|attribute| attribute.as_str().ok())
        .any(|common_name| hostname_matches_presented(hostname, common_name))
}

/// Matches a reference hostname against one presented DNS identifier.
///
/// A wildcard is honoured only in the left-most label, may appear once, and
/// stands for one or more characters of exactly one label.
pub fn hostname_matches_presented(hostname: &str, presented: &str) -> bool {
    if presented.is_empty() || !presented.is_ascii() || !hostname.is_ascii() {
        return false;
    }

    let hostname = strip_trailing_dot(hostname).to_ascii_lowercase();
    let presented = strip_trailing_dot(presented).to_ascii_lowercase();

    let presented_labels: Vec<&str> = presented.split('.').collect();
    if presented_labels.len() < 2 {
        return presented == hostname;
    }

    let host_labels: Vec<&str> = hostname.split('.').collect();
    if presented_labels.len() != host_labels.len() {
        return false;
    }

    let (presented_first, presented_rest) = presented_labels.split_at(1);
    let (host_first, host_rest) = host_labels.split_at(1);
    if !left_most_label_matches(host_first[0], presented_first[0]) {
        return false;
    }

    presented_rest == host_rest
}

fn left_most_label_matches(host_label: &str, presented_label: &str) -> bool {
    let parts: Vec<&str> = presented_label.split('*').collect();
    match parts.as_slice() {
        [literal] => *literal == host_label,
        [prefix, suffix] => {
            if host_label.starts_with("xn--") && presented_label != "*" {
                return false;
            }
            prefix.len() + suffix.len() < host_label.len()
                && host_label.starts_with(prefix)
                && host_label.ends_with(suffix)
        }
        _ => false,
    }
}

fn ip_matches_presented(reference: IpAddr, presented: &[u8]) -> bool {
    match (reference, presented.len()) {
        (IpAddr::V4(reference), 4) => reference.octets().as_slice() == presented,
        (IpAddr::V6(reference), 16) => reference.octets().as_slice() == presented,
        _ => false,
    }
}

fn strip_trailing_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}
