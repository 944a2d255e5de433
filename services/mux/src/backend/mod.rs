//! Default API server and etcd backends.
//!
//! The multiplexer only routes traffic; what a cluster answers is up to the
//! backends. The defaults here resolve the target cluster from the listener a
//! request arrived on and answer a small discovery surface, which is enough
//! for clients to verify connectivity and certificates.

mod api;
mod etcd;

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use crate::error::Result;
use crate::registry::SharedRegistry;

pub use api::{api_server_handler, Status};
pub use etcd::etcd_handler;

/// Resources served under `/api/v1` by default.
pub const DEFAULT_API_RESOURCES: &[&str] = &[
    "configmaps",
    "namespaces",
    "nodes",
    "pods",
    "secrets",
    "services",
];

/// Access to the object store behind the simulated clusters.
pub trait Manager: Send + Sync {
    /// Resource names known to the schema.
    fn api_resources(&self) -> Vec<String>;

    /// Whether a resource group (the objects of one cluster) exists.
    fn has_resource_group(&self, name: &str) -> bool;
}

/// Manager keeping only the set of resource groups.
pub struct InMemoryManager {
    resources: Vec<String>,
    resource_groups: RwLock<BTreeSet<String>>,
}

impl InMemoryManager {
    pub fn new() -> Self {
        Self::with_resources(DEFAULT_API_RESOURCES.iter().map(|r| r.to_string()))
    }

    pub fn with_resources(resources: impl IntoIterator<Item = String>) -> Self {
        Self {
            resources: resources.into_iter().collect(),
            resource_groups: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn add_resource_group(&self, name: &str) {
        self.resource_groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
    }

    pub fn delete_resource_group(&self, name: &str) {
        self.resource_groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

impl Default for InMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager for InMemoryManager {
    fn api_resources(&self) -> Vec<String> {
        self.resources.clone()
    }

    fn has_resource_group(&self, name: &str) -> bool {
        self.resource_groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

/// Maps the `host:port` a request arrived on to the cluster served there.
///
/// Listener and resource group share the cluster name.
#[derive(Clone)]
pub struct ClusterResolver {
    registry: SharedRegistry,
}

impl ClusterResolver {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    pub async fn resolve(&self, host: &str) -> Result<String> {
        let registry = self.registry.read().await;
        registry.cluster_for_address(host).map(str::to_string)
    }
}
