//! Per-cluster listener record.
//!
//! A `ClusterListener` tracks everything the multiplexer knows about one
//! simulated workload cluster: the reserved port, the API server and etcd
//! member identities that joined, the certificates minted for them, and
//! whether the cluster's socket is bound.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use serde::Serialize;
use wklmux_networking::join_host_port;
use wklmux_pki::{new_cert_and_key, CertProfile, CertificateAuthority, IssuedCertificate};

use crate::error::{MuxError, Result};

/// Cloneable view of a listener handed to administrative callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ListenerInfo {
    /// `host:port` of the listener.
    pub fn host_port(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// URL of the listener (https://host:port).
    pub fn address(&self) -> String {
        format!("https://{}", self.host_port())
    }
}

/// Credentials for a test harness to act as cluster admin.
#[derive(Debug, Clone)]
pub struct AdminCredentials {
    /// PEM-encoded admin client certificate.
    pub cert_pem: String,
    /// PEM-encoded admin client key.
    pub key_pem: String,
    /// PEM-encoded CA certificate of the API server.
    pub ca_cert_pem: String,
}

/// State of one simulated workload cluster.
pub struct ClusterListener {
    name: String,
    host: String,
    port: u16,

    api_servers: BTreeSet<String>,
    etcd_members: BTreeSet<String>,

    api_server_ca: Option<CertificateAuthority>,
    api_server_certificate: Option<Arc<CertifiedKey>>,
    admin_certificate: Option<IssuedCertificate>,
    etcd_serving_certificates: HashMap<String, Arc<CertifiedKey>>,

    /// Set once the socket is bound; cleared only if serving never started.
    bound_addr: Option<SocketAddr>,
}

impl ClusterListener {
    pub(crate) fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            api_servers: BTreeSet::new(),
            etcd_members: BTreeSet::new(),
            api_server_ca: None,
            api_server_certificate: None,
            admin_certificate: None,
            etcd_serving_certificates: HashMap::new(),
            bound_addr: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host_port(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    pub fn info(&self) -> ListenerInfo {
        ListenerInfo {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Whether the cluster's socket is bound and served.
    pub fn is_listening(&self) -> bool {
        self.bound_addr.is_some()
    }

    pub(crate) fn mark_listening(&mut self, addr: SocketAddr) {
        self.bound_addr = Some(addr);
    }

    /// Forget a socket that was never served, along with every API server
    /// identity, so a cluster without a socket reports no API servers.
    pub(crate) fn unbind(&mut self) {
        self.bound_addr = None;
        self.api_servers.clear();
    }

    pub fn has_api_server(&self, identity: &str) -> bool {
        self.api_servers.contains(identity)
    }

    pub fn has_etcd_member(&self, identity: &str) -> bool {
        self.etcd_members.contains(identity)
    }

    pub fn api_servers(&self) -> impl Iterator<Item = &str> {
        self.api_servers.iter().map(String::as_str)
    }

    pub fn etcd_members(&self) -> impl Iterator<Item = &str> {
        self.etcd_members.iter().map(String::as_str)
    }

    /// Record an API server instance, minting the shared serving certificate
    /// and the admin certificate on first join.
    pub(crate) fn add_api_server(
        &mut self,
        identity: &str,
        ca: &CertificateAuthority,
    ) -> Result<()> {
        self.prepare_api_server(identity, ca)?;
        self.record_api_server(identity);
        Ok(())
    }

    /// Check the CA and mint the API server certificates without recording
    /// the identity. Certificates are never replaced once issued, so a failed
    /// join can be retried as is.
    pub(crate) fn prepare_api_server(
        &mut self,
        identity: &str,
        ca: &CertificateAuthority,
    ) -> Result<()> {
        match &self.api_server_ca {
            Some(existing) if existing != ca => {
                return Err(MuxError::CaMismatch {
                    cluster: self.name.clone(),
                    identity: identity.to_string(),
                })
            }
            Some(_) => {}
            None => self.api_server_ca = Some(ca.clone()),
        }

        // There is only one serving certificate for all API server instances;
        // they are all reached through the same endpoint.
        if self.api_server_certificate.is_none() {
            let issued = new_cert_and_key(ca, &CertProfile::api_server(&self.host))
                .map_err(|e| MuxError::certificate(&self.name, identity, "API server serving", e))?;
            let key = certified_key(&issued)
                .map_err(|e| MuxError::certificate(&self.name, identity, "API server serving", e))?;
            self.api_server_certificate = Some(key);
        }

        if self.admin_certificate.is_none() {
            let issued = new_cert_and_key(ca, &CertProfile::admin_client())
                .map_err(|e| MuxError::certificate(&self.name, identity, "admin", e))?;
            self.admin_certificate = Some(issued);
        }

        Ok(())
    }

    pub(crate) fn record_api_server(&mut self, identity: &str) {
        self.api_servers.insert(identity.to_string());
    }

    /// Record an etcd member, minting its dedicated serving certificate on
    /// first join so forwarded connections can target a specific member.
    pub(crate) fn add_etcd_member(
        &mut self,
        identity: &str,
        ca: &CertificateAuthority,
    ) -> Result<()> {
        let key_name = normalize_server_name(identity);
        if !self.etcd_serving_certificates.contains_key(&key_name) {
            let issued = new_cert_and_key(ca, &CertProfile::etcd_server(identity, &self.host))
                .map_err(|e| MuxError::certificate(&self.name, identity, "etcd serving", e))?;
            let key = certified_key(&issued)
                .map_err(|e| MuxError::certificate(&self.name, identity, "etcd serving", e))?;
            self.etcd_serving_certificates.insert(key_name, key);
        }

        self.etcd_members.insert(identity.to_string());
        Ok(())
    }

    /// Pick the serving certificate for a TLS handshake.
    ///
    /// Forwarded etcd connections set the server name to the targeted etcd
    /// member; anything else is assumed to target the API server.
    pub fn serving_certificate(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>> {
        if let Some(name) = server_name.map(normalize_server_name) {
            if let Some(key) = self.etcd_serving_certificates.get(&name) {
                return Ok(Arc::clone(key));
            }
        }

        self.api_server_certificate
            .clone()
            .ok_or_else(|| MuxError::MissingServingCertificate {
                cluster: self.name.clone(),
            })
    }

    pub fn admin_credentials(&self) -> Option<AdminCredentials> {
        let admin = self.admin_certificate.as_ref()?;
        let ca = self.api_server_ca.as_ref()?;
        Some(AdminCredentials {
            cert_pem: admin.cert_pem().to_string(),
            key_pem: admin.key_pem().to_string(),
            ca_cert_pem: ca.cert_pem().to_string(),
        })
    }
}

/// Normalize a TLS server name for matching: lowercase, trailing dot trimmed.
pub fn normalize_server_name(name: &str) -> String {
    name.to_lowercase().trim_end_matches('.').to_string()
}

/// Convert a minted certificate into the form rustls serves.
pub(crate) fn certified_key(
    issued: &IssuedCertificate,
) -> std::result::Result<Arc<CertifiedKey>, rustls::Error> {
    let cert = CertificateDer::from(issued.cert_der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(issued.key_der().to_vec()));
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(Arc::new(CertifiedKey::new(vec![cert], signing_key)))
}
