//! Lifecycle controller for workload cluster listeners.
//!
//! `WorkloadClustersMux` is the administrative entry point: a cluster's port
//! is reserved with `init_listener`, its socket is bound when the first API
//! server joins, and etcd members only contribute certificates. Per cluster
//! the state only moves forward (absent, reserved, listening).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::time::Instant;
use tracing::{error, info};
use wklmux_networking::PortRange;
use wklmux_pki::CertificateAuthority;

use crate::backend::{api_server_handler, etcd_handler, ClusterResolver, Manager};
use crate::debug::DebugServer;
use crate::error::{MuxError, Result};
use crate::registry::{AdminCredentials, ClusterEndpoint, ListenerInfo, Registry, SharedRegistry};
use crate::server::{self, MixedHandler, MuxServer, DEFAULT_MAX_CONNECTIONS};

/// Default address of the debug endpoint.
pub const DEFAULT_DEBUG_ADDRESS: &str = "127.0.0.1:19000";

/// Settings of one multiplexer instance.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Host every cluster listener binds to.
    pub host: String,

    /// Ports handed out to clusters.
    pub port_range: PortRange,

    /// Address of the cleartext debug endpoint.
    pub debug_address: String,

    /// Maximum concurrent connections across all clusters.
    pub max_connections: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port_range: PortRange::default(),
            debug_address: DEFAULT_DEBUG_ADDRESS.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Serves the API server and etcd endpoints of many workload clusters,
/// one port per cluster.
pub struct WorkloadClustersMux {
    registry: SharedRegistry,
    server: MuxServer,
    debug_server: DebugServer,
}

impl WorkloadClustersMux {
    /// Create a multiplexer answering with the default backends.
    pub async fn new(config: MuxConfig, manager: Arc<dyn Manager>) -> Result<Self> {
        Self::with_backends(config, move |resolver| {
            (
                api_server_handler(Arc::clone(&manager), resolver.clone()),
                etcd_handler(manager, resolver),
            )
        })
        .await
    }

    /// Create a multiplexer with caller supplied API server and etcd
    /// backends. `build` receives the resolver mapping listener addresses
    /// to cluster names.
    pub async fn with_backends<F>(config: MuxConfig, build: F) -> Result<Self>
    where
        F: FnOnce(ClusterResolver) -> (Router, Router),
    {
        let registry = Registry::new(&config.host, config.port_range).shared();

        let (api_server, etcd) = build(ClusterResolver::new(Arc::clone(&registry)));
        let server = MuxServer::new(
            Arc::clone(&registry),
            MixedHandler::new(api_server, etcd),
            config.max_connections,
        );

        let debug_server = DebugServer::bind(&config.debug_address, registry.clone())
            .await
            .map_err(|e| MuxError::DebugBind {
                address: config.debug_address.clone(),
                source: e,
            })?;

        info!(
            host = %config.host,
            port_range = %config.port_range,
            debug_address = %debug_server.local_addr(),
            "Workload clusters multiplexer started"
        );

        Ok(Self {
            registry,
            server,
            debug_server,
        })
    }

    /// Address the debug endpoint is bound to.
    pub fn debug_address(&self) -> SocketAddr {
        self.debug_server.local_addr()
    }

    /// Reserve a port for a cluster. Returns the existing reservation if the
    /// cluster already has one.
    pub async fn init_listener(&self, cluster: &str) -> Result<ListenerInfo> {
        self.registry.write().await.init_listener(cluster)
    }

    /// Add an API server instance to a cluster.
    ///
    /// The first instance mints the serving and admin certificates and binds
    /// the cluster's socket; the call returns once the socket is accepting.
    pub async fn add_api_server(
        &self,
        cluster: &str,
        identity: &str,
        ca: &CertificateAuthority,
    ) -> Result<()> {
        if self.server.is_shutting_down() {
            return Err(MuxError::ShuttingDown);
        }

        let (listener, address) = {
            let mut registry = self.registry.write().await;
            let record = registry
                .get_mut(cluster)
                .ok_or_else(|| MuxError::NotInitialized {
                    cluster: cluster.to_string(),
                    role: "API server",
                    identity: identity.to_string(),
                })?;

            if record.is_listening() {
                record.add_api_server(identity, ca)?;
                info!(cluster = %cluster, identity = %identity, "API server instance added");
                return Ok(());
            }

            // The identity is recorded only once the socket is bound, so a
            // failed bind leaves the cluster without API servers.
            record.prepare_api_server(identity, ca)?;
            let address = record.host_port();
            let listener = server::bind(&address).map_err(|e| MuxError::Bind {
                cluster: cluster.to_string(),
                address: address.clone(),
                source: e,
            })?;
            record.mark_listening(listener.local_addr()?);
            record.record_api_server(identity);
            info!(cluster = %cluster, identity = %identity, "API server instance added");
            (listener, address)
        };

        if let Err(e) = self.server.serve(cluster, &address, listener).await {
            if let Some(record) = self.registry.write().await.get_mut(cluster) {
                record.unbind();
            }
            return Err(e);
        }
        info!(cluster = %cluster, address = %address, "Workload cluster listener started");
        Ok(())
    }

    /// Add an etcd member to a cluster.
    pub async fn add_etcd_member(
        &self,
        cluster: &str,
        identity: &str,
        ca: &CertificateAuthority,
    ) -> Result<()> {
        let mut registry = self.registry.write().await;
        let record = registry
            .get_mut(cluster)
            .ok_or_else(|| MuxError::NotInitialized {
                cluster: cluster.to_string(),
                role: "etcd member",
                identity: identity.to_string(),
            })?;

        record.add_etcd_member(identity, ca)?;
        info!(cluster = %cluster, identity = %identity, "etcd member added");
        Ok(())
    }

    pub async fn has_api_server(&self, cluster: &str, identity: &str) -> bool {
        self.registry
            .read()
            .await
            .get(cluster)
            .is_some_and(|l| l.has_api_server(identity))
    }

    pub async fn has_etcd_member(&self, cluster: &str, identity: &str) -> bool {
        self.registry
            .read()
            .await
            .get(cluster)
            .is_some_and(|l| l.has_etcd_member(identity))
    }

    /// Whether the cluster's socket is bound.
    pub async fn is_listening(&self, cluster: &str) -> bool {
        self.registry
            .read()
            .await
            .get(cluster)
            .is_some_and(|l| l.is_listening())
    }

    /// Rebuild port reservations for clusters created by a previous process.
    ///
    /// Best effort: sockets are bound again when API servers re-join.
    /// Returns the number of restored clusters.
    pub async fn hot_restart(&self, endpoints: &[ClusterEndpoint]) -> Result<usize> {
        self.registry.write().await.restore(endpoints)
    }

    /// Credentials to act as admin of a cluster, once an API server joined.
    pub async fn admin_credentials(&self, cluster: &str) -> Option<AdminCredentials> {
        self.registry
            .read()
            .await
            .get(cluster)
            .and_then(|l| l.admin_credentials())
    }

    /// Cluster name to listener URL.
    pub async fn list_listeners(&self) -> BTreeMap<String, String> {
        self.registry.read().await.list_listeners()
    }

    /// Endpoints of every cluster, suitable for `hot_restart`.
    pub async fn endpoints(&self) -> Vec<ClusterEndpoint> {
        self.registry.read().await.endpoints()
    }

    /// Stop the debug endpoint, then every cluster listener.
    ///
    /// Both steps always run; the first failure is returned.
    pub async fn shutdown(&self, deadline: Instant) -> Result<()> {
        let debug = self.debug_server.shutdown(deadline).await;
        if let Err(e) = &debug {
            error!(error = %e, "Failed to shutdown the debug server");
        }

        let server = self.server.shutdown(deadline).await;
        if let Err(e) = &server {
            error!(error = %e, "Failed to shutdown the workload clusters server");
        }

        debug.and(server)
    }
}
