//! Listener registry.
//!
//! The registry owns every `ClusterListener`, the reverse index from the
//! `host:port` a listener is bound to back to its cluster name, and the port
//! allocator. It is plain data: callers share it as [`SharedRegistry`] and
//! serialize access through a single reader/writer lock. Administrative
//! operations take the write lock; handshake and request time lookups take
//! the read lock so concurrent connections never serialize on each other.

mod listener;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use wklmux_networking::{join_host_port, PortAllocator, PortRange};

use crate::error::{MuxError, Result};

pub use listener::{normalize_server_name, AdminCredentials, ClusterListener, ListenerInfo};

/// Registry shared between the lifecycle controller and the serving layer.
pub type SharedRegistry = Arc<RwLock<Registry>>;

/// Externally persisted description of a cluster's endpoint, used to
/// rebuild the registry after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEndpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// All listeners served by one multiplexer, for one bind host.
pub struct Registry {
    host: String,
    ports: PortAllocator,
    listeners: HashMap<String, ClusterListener>,
    /// Maps `host:port` to the workload cluster name.
    cluster_by_host: HashMap<String, String>,
}

impl Registry {
    /// Create an empty registry handing out ports from `range` on `host`.
    pub fn new(host: &str, range: PortRange) -> Self {
        Self {
            host: host.to_string(),
            ports: PortAllocator::new(range),
            listeners: HashMap::new(),
            cluster_by_host: HashMap::new(),
        }
    }

    /// Wrap the registry for sharing.
    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn get(&self, cluster: &str) -> Option<&ClusterListener> {
        self.listeners.get(cluster)
    }

    pub(crate) fn get_mut(&mut self, cluster: &str) -> Option<&mut ClusterListener> {
        self.listeners.get_mut(cluster)
    }

    /// Port the next new listener would get, if any are left.
    pub fn next_port(&self) -> Option<u16> {
        self.ports.next_port()
    }

    /// Reserve a port for a cluster, or return the existing reservation.
    pub fn init_listener(&mut self, cluster: &str) -> Result<ListenerInfo> {
        if let Some(existing) = self.listeners.get(cluster) {
            return Ok(existing.info());
        }

        let port = self.ports.allocate()?;

        Ok(self.insert_listener(cluster, port))
    }

    fn insert_listener(&mut self, cluster: &str, port: u16) -> ListenerInfo {
        let listener = ClusterListener::new(cluster, &self.host, port);
        let info = listener.info();

        self.cluster_by_host
            .insert(listener.host_port(), cluster.to_string());
        self.listeners.insert(cluster.to_string(), listener);

        info!(
            cluster = %cluster,
            address = %info.address(),
            "Workload cluster listener created"
        );
        info
    }

    /// Rebuild listener reservations from externally persisted endpoints.
    ///
    /// Every entry is validated before anything is inserted, so a rejected
    /// restore leaves the registry untouched. Entries without a host never
    /// got an endpoint and are skipped. Sockets are not bound here; they are
    /// re-created when API servers are added again.
    pub fn restore(&mut self, endpoints: &[ClusterEndpoint]) -> Result<usize> {
        if endpoints.is_empty() {
            return Ok(0);
        }

        if !self.listeners.is_empty() {
            return Err(MuxError::AlreadyInitialized);
        }

        let mut ports = HashSet::new();
        let mut names = HashSet::new();
        let mut accepted = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if endpoint.host.is_empty() {
                debug!(cluster = %endpoint.name, "Skipping cluster without endpoint");
                continue;
            }

            if endpoint.host != self.host {
                return Err(MuxError::HostMismatch {
                    expected: self.host.clone(),
                    found: endpoint.host.clone(),
                });
            }

            if endpoint.name.is_empty() {
                return Err(MuxError::MissingMetadata {
                    endpoint: join_host_port(&endpoint.host, endpoint.port),
                    field: "cluster name",
                });
            }

            if endpoint.port == 0 {
                return Err(MuxError::MissingMetadata {
                    endpoint: endpoint.name.clone(),
                    field: "port",
                });
            }

            if !ports.insert(endpoint.port) {
                return Err(MuxError::DuplicatePort(endpoint.port));
            }

            // A name listed twice would leave a dangling reverse index entry.
            if !names.insert(endpoint.name.as_str()) {
                return Err(MuxError::MissingMetadata {
                    endpoint: endpoint.name.clone(),
                    field: "unique cluster name",
                });
            }

            accepted.push(endpoint);
        }

        if let Some(max_port) = accepted.iter().map(|e| e.port).max() {
            self.ports.reserve_through(max_port);
        }

        for endpoint in &accepted {
            self.insert_listener(&endpoint.name, endpoint.port);
        }

        info!(
            restored = accepted.len(),
            next_port = ?self.next_port(),
            "Listener registry hot restarted"
        );
        Ok(accepted.len())
    }

    /// Resolve the cluster served on `host` (`host:port` of the listener).
    pub fn cluster_for_address(&self, host: &str) -> Result<&str> {
        self.cluster_by_host
            .get(host)
            .map(String::as_str)
            .ok_or_else(|| MuxError::UnknownAddress(host.to_string()))
    }

    /// Select the certificate for a TLS handshake accepted on
    /// `local_address` with the requested `server_name`.
    pub fn resolve_certificate(
        &self,
        local_address: &str,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>> {
        let cluster = self.cluster_for_address(local_address)?;

        let listener = self
            .listeners
            .get(cluster)
            .ok_or_else(|| MuxError::UnknownCluster {
                cluster: cluster.to_string(),
                address: local_address.to_string(),
            })?;

        listener.serving_certificate(server_name)
    }

    /// Snapshot of cluster name to listener URL.
    pub fn list_listeners(&self) -> BTreeMap<String, String> {
        self.listeners
            .iter()
            .map(|(name, l)| (name.clone(), l.info().address()))
            .collect()
    }

    /// Snapshot of every endpoint, suitable for a later `restore`.
    pub fn endpoints(&self) -> Vec<ClusterEndpoint> {
        let mut endpoints: Vec<_> = self
            .listeners
            .values()
            .map(|l| ClusterEndpoint {
                name: l.name().to_string(),
                host: l.host().to_string(),
                port: l.port(),
            })
            .collect();
        endpoints.sort_by_key(|e| e.port);
        endpoints
    }
}
