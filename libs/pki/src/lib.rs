//! Certificate issuance for simulated workload clusters.
//!
//! Every simulated cluster brings its own certificate authority. Given that
//! CA and a declarative [`CertProfile`], [`new_cert_and_key`] mints a fresh
//! key pair and a leaf certificate signed by the CA.
//!
//! Profiles exist for the three kinds of certificates the multiplexer needs:
//! - the API server serving certificate (shared by all API server instances)
//! - the admin client certificate handed to test harnesses
//! - one serving certificate per etcd member

use std::net::{IpAddr, Ipv4Addr};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;

/// Validity of CA certificates created by [`CertificateAuthority::new`] (10 years).
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Validity of leaf certificates (1 year).
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Backdating applied to `not_before` to tolerate small clock skew.
const CLOCK_SKEW_MINUTES: i64 = 5;

/// PKI errors.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed.
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed.
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key parsing error.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Invalid subject alternative name.
    #[error("invalid DNS name '{name}': {reason}")]
    InvalidDnsName { name: String, reason: String },
}

/// Result type for PKI operations.
pub type Result<T> = std::result::Result<T, PkiError>;

fn validity(days: i64) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    (
        now - time::Duration::minutes(CLOCK_SKEW_MINUTES),
        now + time::Duration::days(days),
    )
}

fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    if let Some(org) = organization {
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(org.to_string()),
        );
    }
    dn
}

// ============================================================================
// Certificate authority
// ============================================================================

/// A certificate authority, kept as PEM.
///
/// rcgen's `KeyPair` is not `Clone`, so the signing pair is re-parsed on
/// every issuance.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA.
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, None);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = validity(CA_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Load a CA from PEM-encoded certificate and key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    /// PEM-encoded CA certificate.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM-encoded CA private key.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Rebuild an issuer usable by rcgen for signing.
    fn issuer(&self) -> Result<(Certificate, KeyPair)> {
        let key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(&self.cert_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA cert: {}", e)))?;
        let cert = params.self_signed(&key).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to rebuild CA issuer: {}", e))
        })?;
        Ok((cert, key))
    }
}

// ============================================================================
// Profiles
// ============================================================================

/// What a leaf certificate may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertUsage {
    ServerAuth,
    ClientAuth,
}

/// Declarative description of a leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertProfile {
    pub common_name: String,
    pub organization: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub usages: Vec<CertUsage>,
}

impl CertProfile {
    /// Serving certificate shared by every API server instance of a cluster.
    pub fn api_server(host: &str) -> Self {
        let mut profile = Self {
            common_name: "kube-apiserver".to_string(),
            organization: None,
            dns_names: vec![
                "kubernetes".to_string(),
                "kubernetes.default".to_string(),
                "kubernetes.default.svc".to_string(),
                "kubernetes.default.svc.cluster.local".to_string(),
                "localhost".to_string(),
            ],
            ip_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            usages: vec![CertUsage::ServerAuth],
        };
        profile.add_host(host);
        profile
    }

    /// Client certificate for test harnesses to act as cluster admin.
    pub fn admin_client() -> Self {
        Self {
            common_name: "kubernetes-admin".to_string(),
            organization: Some("system:masters".to_string()),
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
            usages: vec![CertUsage::ClientAuth],
        }
    }

    /// Serving certificate for one etcd member.
    pub fn etcd_server(member: &str, host: &str) -> Self {
        let mut profile = Self {
            common_name: member.to_string(),
            organization: None,
            dns_names: vec![member.to_string(), "localhost".to_string()],
            ip_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            usages: vec![CertUsage::ServerAuth, CertUsage::ClientAuth],
        };
        profile.add_host(host);
        profile
    }

    fn add_host(&mut self, host: &str) {
        match host.parse::<IpAddr>() {
            Ok(ip) if !self.ip_addresses.contains(&ip) => self.ip_addresses.push(ip),
            Ok(_) => {}
            Err(_) if !host.is_empty() && !self.dns_names.iter().any(|n| n == host) => {
                self.dns_names.push(host.to_string())
            }
            Err(_) => {}
        }
    }

    fn to_params(&self) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();
        params.distinguished_name =
            distinguished_name(&self.common_name, self.organization.as_deref());
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = self
            .usages
            .iter()
            .map(|usage| match usage {
                CertUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
                CertUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
            })
            .collect();

        let (not_before, not_after) = validity(CERT_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let mut sans = Vec::with_capacity(self.dns_names.len() + self.ip_addresses.len());
        for name in &self.dns_names {
            let dns = Ia5String::try_from(name.clone()).map_err(|e| PkiError::InvalidDnsName {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            sans.push(SanType::DnsName(dns));
        }
        sans.extend(self.ip_addresses.iter().copied().map(SanType::IpAddress));
        params.subject_alt_names = sans;

        Ok(params)
    }
}

// ============================================================================
// Issuance
// ============================================================================

/// A freshly minted leaf certificate and its private key.
#[derive(Clone)]
pub struct IssuedCertificate {
    cert_der: Vec<u8>,
    cert_pem: String,
    key_der: Vec<u8>,
    key_pem: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

impl IssuedCertificate {
    /// DER-encoded certificate.
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// PEM-encoded certificate.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER-encoded PKCS#8 private key.
    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// PEM-encoded PKCS#8 private key.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }
}

/// Mint a new key pair and a certificate for `profile`, signed by `ca`.
pub fn new_cert_and_key(ca: &CertificateAuthority, profile: &CertProfile) -> Result<IssuedCertificate> {
    let params = profile.to_params()?;

    let key = KeyPair::generate().map_err(|e| {
        PkiError::KeyGenerationFailed(format!(
            "failed to generate key for {}: {}",
            profile.common_name, e
        ))
    })?;

    let (issuer, issuer_key) = ca.issuer()?;
    let cert = params.signed_by(&key, &issuer, &issuer_key).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!(
            "failed to sign certificate for {}: {}",
            profile.common_name, e
        ))
    })?;

    Ok(IssuedCertificate {
        cert_der: cert.der().to_vec(),
        cert_pem: cert.pem(),
        key_der: key.serialize_der(),
        key_pem: key.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_can_be_created() {
        let ca = CertificateAuthority::new("wklmux test CA").expect("CA creation should succeed");
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn ca_roundtrips_through_pem() {
        let ca = CertificateAuthority::new("roundtrip CA").unwrap();
        let loaded = CertificateAuthority::from_pem(ca.cert_pem(), ca.key_pem()).unwrap();
        assert_eq!(ca, loaded);
    }

    #[test]
    fn from_pem_rejects_garbage() {
        assert!(CertificateAuthority::from_pem("not a cert", "not a key").is_err());
    }

    #[test]
    fn distinct_cas_are_not_equal() {
        let a = CertificateAuthority::new("A").unwrap();
        let b = CertificateAuthority::new("B").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn api_server_profile_includes_host() {
        let profile = CertProfile::api_server("10.0.0.7");
        assert_eq!(profile.common_name, "kube-apiserver");
        assert!(profile.ip_addresses.contains(&"10.0.0.7".parse().unwrap()));
        assert!(profile.dns_names.contains(&"kubernetes.default.svc".to_string()));

        // Loopback host is not duplicated.
        let profile = CertProfile::api_server("127.0.0.1");
        assert_eq!(profile.ip_addresses.len(), 1);

        let profile = CertProfile::api_server("cluster.example.test");
        assert!(profile.dns_names.contains(&"cluster.example.test".to_string()));
    }

    #[test]
    fn etcd_profile_names_the_member() {
        let profile = CertProfile::etcd_server("etcd-0", "127.0.0.1");
        assert_eq!(profile.common_name, "etcd-0");
        assert!(profile.dns_names.contains(&"etcd-0".to_string()));
        assert_eq!(
            profile.usages,
            vec![CertUsage::ServerAuth, CertUsage::ClientAuth]
        );
    }

    #[test]
    fn issues_leaf_certificates() {
        let ca = CertificateAuthority::new("issuer").unwrap();

        let serving = new_cert_and_key(&ca, &CertProfile::api_server("127.0.0.1")).unwrap();
        assert!(serving.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(!serving.cert_der().is_empty());
        assert!(!serving.key_der().is_empty());

        let admin = new_cert_and_key(&ca, &CertProfile::admin_client()).unwrap();
        assert_ne!(serving.cert_der(), admin.cert_der());
        assert_ne!(serving.key_pem(), admin.key_pem());
    }

    #[test]
    fn invalid_dns_name_is_rejected() {
        let ca = CertificateAuthority::new("issuer").unwrap();
        let mut profile = CertProfile::admin_client();
        profile.dns_names.push("bad\u{e9}name".to_string());

        let err = new_cert_and_key(&ca, &profile).unwrap_err();
        assert!(matches!(err, PkiError::InvalidDnsName { .. }));
    }
}
