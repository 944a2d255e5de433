//! Error types for the workload clusters multiplexer.

use std::io;

use thiserror::Error;
use wklmux_networking::NetworkError;

/// Errors surfaced by the multiplexer's administrative and serving paths.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Port allocation failed (range exhausted).
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// An identity was added before the cluster's listener was initialized.
    #[error("listener for workload cluster {cluster} must be initialized before adding {role} {identity}")]
    NotInitialized {
        cluster: String,
        role: &'static str,
        identity: String,
    },

    /// A second API server joined with a different certificate authority.
    #[error("API server {identity} for workload cluster {cluster} uses a CA different from the one already in use")]
    CaMismatch { cluster: String, identity: String },

    /// Minting or loading a certificate failed.
    #[error("failed to create {kind} certificate for {identity} in workload cluster {cluster}: {source}")]
    Certificate {
        cluster: String,
        identity: String,
        kind: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Binding the cluster's socket failed.
    #[error("failed to start listener for workload cluster {cluster} on {address}: {source}")]
    Bind {
        cluster: String,
        address: String,
        #[source]
        source: io::Error,
    },

    /// Binding the debug endpoint failed.
    #[error("failed to start debug server on {address}: {source}")]
    DebugBind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// No cluster serves on the given address.
    #[error("failed to get workload cluster serving on {0}")]
    UnknownAddress(String),

    /// The reverse index points to a cluster that has no record.
    #[error("failed to get listener {cluster} for workload cluster serving on {address}")]
    UnknownCluster { cluster: String, address: String },

    /// A TLS connection arrived before any API server joined the cluster.
    #[error("workload cluster {cluster} has no API server serving certificate")]
    MissingServingCertificate { cluster: String },

    /// Hot restart attempted after listeners were already created.
    #[error("the multiplexer cannot be hot restarted when there are already initialized listeners")]
    AlreadyInitialized,

    /// Hot restart entry bound to a different host.
    #[error("unable to hot restart, the host address is changed from {found} to {expected}")]
    HostMismatch { expected: String, found: String },

    /// Two hot restart entries claim the same port.
    #[error("unable to hot restart, there are two or more clusters using port {0}")]
    DuplicatePort(u16),

    /// Hot restart entry without the data needed to rebuild it.
    #[error("unable to hot restart, cluster endpoint {endpoint} is missing {field}")]
    MissingMetadata {
        endpoint: String,
        field: &'static str,
    },

    /// The multiplexer has been shut down.
    #[error("the multiplexer is shutting down")]
    ShuttingDown,

    /// A component failed while shutting down.
    #[error("failed to shutdown the {component}: {source}")]
    Shutdown {
        component: &'static str,
        #[source]
        source: io::Error,
    },

    /// A component did not drain before the deadline.
    #[error("timed out shutting down the {0}")]
    ShutdownTimeout(&'static str),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MuxError {
    pub(crate) fn certificate(
        cluster: &str,
        identity: &str,
        kind: &'static str,
        err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        MuxError::Certificate {
            cluster: cluster.to_string(),
            identity: identity.to_string(),
            kind,
            source: err.into(),
        }
    }

    /// Returns true if the port range is exhausted.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, MuxError::Network(NetworkError::PoolExhausted(_)))
    }
}

/// Result type for multiplexer operations.
pub type Result<T> = std::result::Result<T, MuxError>;
