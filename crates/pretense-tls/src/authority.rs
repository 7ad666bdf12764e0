use std::collections::{HashMap, VecDeque};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use crate::material::{ensure_key_matches_leaf, CertificateContext};
use crate::TlsConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackAuthorityConfig {
    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub ca_common_name: String,
    pub ca_organization: String,
    pub leaf_cache_capacity: usize,
}

impl Default for FallbackAuthorityConfig {
    fn default() -> Self {
        Self {
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            ca_common_name: "pretense Trusted Test CA".to_string(),
            ca_organization: "pretense".to_string(),
            leaf_cache_capacity: 256,
        }
    }
}

impl FallbackAuthorityConfig {
    pub fn validate(&self) -> Result<(), TlsConfigError> {
        match (
            self.ca_cert_pem_path.as_ref(),
            self.ca_key_pem_path.as_ref(),
        ) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => {
                return Err(TlsConfigError::InvalidConfiguration(
                    "ca_cert_pem_path and ca_key_pem_path must either both be set or both be unset"
                        .to_string(),
                ));
            }
        }

        if self.ca_common_name.trim().is_empty() {
            return Err(TlsConfigError::InvalidConfiguration(
                "ca_common_name must not be empty".to_string(),
            ));
        }
        if self.ca_organization.trim().is_empty() {
            return Err(TlsConfigError::InvalidConfiguration(
                "ca_organization must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthorityMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
    pub leaves_resigned: u64,
}

/// The CA that signs certificates for every destination that is not under
/// test. Its key material never changes after construction.
pub struct FallbackAuthority {
    config: FallbackAuthorityConfig,
    ca: CaMaterial,
    cache: Mutex<LeafCache>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
    leaves_resigned: AtomicU64,
}

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
}

#[derive(Default)]
struct LeafCache {
    entries: HashMap<String, CertificateContext>,
    lru: VecDeque<String>,
}

/// Subject identity copied from a genuine certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PresentedIdentity {
    common_name: Option<String>,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
}

impl PresentedIdentity {
    fn cache_key(&self) -> String {
        let ips: Vec<String> = self.ip_addresses.iter().map(IpAddr::to_string).collect();
        format!(
            "resign|cn={}|dns={}|ip={}",
            self.common_name.as_deref().unwrap_or_default(),
            self.dns_names.join(","),
            ips.join(",")
        )
    }
}

impl FallbackAuthority {
    pub fn new(config: FallbackAuthorityConfig) -> Result<Self, TlsConfigError> {
        config.validate()?;
        let ca = load_or_generate_ca_material(&config)?;
        Ok(Self::with_material(config, ca))
    }

    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        config: FallbackAuthorityConfig,
    ) -> Result<Self, TlsConfigError> {
        config.validate()?;
        let ca = parse_ca_material(cert_pem.to_string(), key_pem.to_string(), "<memory>")?;
        Ok(Self::with_material(config, ca))
    }

    fn with_material(config: FallbackAuthorityConfig, ca: CaMaterial) -> Self {
        Self {
            config,
            ca,
            cache: Mutex::new(LeafCache::default()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
            leaves_resigned: AtomicU64::new(0),
        }
    }

    pub fn ca_certificate_der(&self) -> &CertificateDer<'static> {
        &self.ca.cert_der
    }

    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca.cert_pem
    }

    pub fn ca_key_pem(&self) -> &str {
        &self.ca.key_pem
    }

    /// Certificate context for `host`, signed by this CA.
    pub fn issue_for_host(&self, host: &str) -> Result<CertificateContext, TlsConfigError> {
        let normalized_host = normalize_host(host);
        if normalized_host.is_empty() {
            return Err(TlsConfigError::InvalidConfiguration(
                "cannot issue a certificate for an empty host".to_string(),
            ));
        }
        let identity = if let Ok(ip) = normalized_host.parse::<IpAddr>() {
            PresentedIdentity {
                common_name: Some(normalized_host.clone()),
                dns_names: Vec::new(),
                ip_addresses: vec![ip],
            }
        } else {
            PresentedIdentity {
                common_name: Some(normalized_host.clone()),
                dns_names: vec![normalized_host.clone()],
                ip_addresses: Vec::new(),
            }
        };

        self.cached_or_issue(&format!("host|{normalized_host}"), &identity, || {
            self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Re-signs a genuine certificate with this CA, keeping its subject common
    /// name and DNS/IP subjectAltNames.
    pub fn resign(&self, genuine_der: &[u8]) -> Result<CertificateContext, TlsConfigError> {
        let identity = presented_identity(genuine_der)?;
        self.cached_or_issue(&identity.cache_key(), &identity, || {
            self.leaves_resigned.fetch_add(1, Ordering::Relaxed);
        })
    }

    pub fn metrics_snapshot(&self) -> AuthorityMetricsSnapshot {
        AuthorityMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
            leaves_resigned: self.leaves_resigned.load(Ordering::Relaxed),
        }
    }

    fn cached_or_issue(
        &self,
        cache_key: &str,
        identity: &PresentedIdentity,
        on_issue: impl FnOnce(),
    ) -> Result<CertificateContext, TlsConfigError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| TlsConfigError::LockPoisoned)?;

        if let Some(context) = cache.entries.get(cache_key).cloned() {
            touch_lru(&mut cache.lru, cache_key);
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(context);
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let context = issue_leaf(&self.ca, identity)?;
        on_issue();

        if self.config.leaf_cache_capacity > 0 {
            if cache.entries.len() >= self.config.leaf_cache_capacity {
                evict_lru_entry(&mut cache);
            }
            cache.entries.insert(cache_key.to_string(), context.clone());
            touch_lru(&mut cache.lru, cache_key);
        }

        Ok(context)
    }
}

fn load_or_generate_ca_material(
    config: &FallbackAuthorityConfig,
) -> Result<CaMaterial, TlsConfigError> {
    match (&config.ca_cert_pem_path, &config.ca_key_pem_path) {
        (Some(ca_cert_path), Some(ca_key_path)) => {
            let cert_exists = Path::new(ca_cert_path).exists();
            let key_exists = Path::new(ca_key_path).exists();

            match (cert_exists, key_exists) {
                (true, true) => {
                    let cert_pem = fs::read_to_string(ca_cert_path)?;
                    let key_pem = fs::read_to_string(ca_key_path)?;
                    parse_ca_material(cert_pem, key_pem, ca_cert_path)
                }
                (false, false) => {
                    let generated = generate_ca_material(config)?;
                    persist_ca_material(ca_cert_path, ca_key_path, &generated)?;
                    Ok(generated)
                }
                _ => Err(TlsConfigError::InvalidConfiguration(
                    "CA cert and key files must both exist or both be absent".to_string(),
                )),
            }
        }
        (None, None) => generate_ca_material(config),
        _ => Err(TlsConfigError::InvalidConfiguration(
            "ca_cert_pem_path and ca_key_pem_path must be set together".to_string(),
        )),
    }
}

fn generate_ca_material(config: &FallbackAuthorityConfig) -> Result<CaMaterial, TlsConfigError> {
    let ca_key = KeyPair::generate()?;
    let key_pem = ca_key.serialize_pem();
    let ca_params = build_ca_params(config);
    let ca_cert = ca_params.self_signed(&ca_key)?;
    let cert_pem = ca_cert.pem();
    let cert_der = ca_cert.der().clone();
    let issuer = Issuer::new(ca_params, ca_key);

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn parse_ca_material(
    cert_pem: String,
    key_pem: String,
    origin: &str,
) -> Result<CaMaterial, TlsConfigError> {
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        TlsConfigError::InvalidMaterial(format!(
            "failed to parse CA certificate PEM from {origin}: {error}"
        ))
    })?;
    let key_der = PrivateKeyDer::from_pem_slice(key_pem.as_bytes()).map_err(|error| {
        TlsConfigError::InvalidMaterial(format!(
            "failed to parse CA private key PEM from {origin}: {error}"
        ))
    })?;
    ensure_key_matches_leaf(&cert_der, &key_der).map_err(|error| {
        TlsConfigError::InvalidMaterial(format!("CA material from {origin} is inconsistent: {error}"))
    })?;

    let ca_key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
        TlsConfigError::InvalidMaterial(format!(
            "failed to parse issuer metadata from CA certificate {origin}: {error}"
        ))
    })?;

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn persist_ca_material(
    ca_cert_path: &str,
    ca_key_path: &str,
    ca: &CaMaterial,
) -> Result<(), TlsConfigError> {
    ensure_parent_exists(ca_cert_path)?;
    ensure_parent_exists(ca_key_path)?;

    fs::write(ca_cert_path, ca.cert_pem.as_bytes())?;
    fs::write(ca_key_path, ca.key_pem.as_bytes())?;
    Ok(())
}

fn ensure_parent_exists(path: &str) -> Result<(), TlsConfigError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn presented_identity(genuine_der: &[u8]) -> Result<PresentedIdentity, TlsConfigError> {
    let (_, cert) = parse_x509_certificate(genuine_der).map_err(|error| {
        TlsConfigError::InvalidMaterial(format!("genuine certificate does not parse: {error}"))
    })?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attribute| attribute.as_str().ok())
        .map(str::to_string);

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_san_bytes(bytes) {
                        ip_addresses.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    if common_name.is_none() && dns_names.is_empty() && ip_addresses.is_empty() {
        return Err(TlsConfigError::InvalidMaterial(
            "genuine certificate carries no subject identity to re-sign".to_string(),
        ));
    }

    Ok(PresentedIdentity {
        common_name,
        dns_names,
        ip_addresses,
    })
}

fn ip_from_san_bytes(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Some(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    None
}

fn issue_leaf(
    ca: &CaMaterial,
    identity: &PresentedIdentity,
) -> Result<CertificateContext, TlsConfigError> {
    let leaf_params = build_leaf_params(identity)?;
    let leaf_key = KeyPair::generate()?;
    let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca.issuer)?;

    Ok(CertificateContext::new(
        leaf_cert.der().clone(),
        PrivateKeyDer::from(leaf_key_der),
        vec![ca.cert_der.clone()],
    ))
}

fn build_ca_params(config: &FallbackAuthorityConfig) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.ca_common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.ca_organization.clone());
    params.distinguished_name = distinguished_name;
    params
}

fn build_leaf_params(identity: &PresentedIdentity) -> Result<CertificateParams, TlsConfigError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut distinguished_name = DistinguishedName::new();
    if let Some(common_name) = &identity.common_name {
        distinguished_name.push(DnType::CommonName, common_name.clone());
    }
    params.distinguished_name = distinguished_name;

    for dns_name in &identity.dns_names {
        params
            .subject_alt_names
            .push(SanType::DnsName(dns_name.as_str().try_into()?));
    }
    for ip in &identity.ip_addresses {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }

    Ok(params)
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host.strip_suffix('.').unwrap_or(host);
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn touch_lru(lru: &mut VecDeque<String>, key: &str) {
    if let Some(position) = lru.iter().position(|entry| entry == key) {
        lru.remove(position);
    }
    lru.push_back(key.to_string());
}

fn evict_lru_entry(cache: &mut LeafCache) {
    if let Some(oldest) = cache.lru.pop_front() {
        cache.entries.remove(&oldest);
    }
}
