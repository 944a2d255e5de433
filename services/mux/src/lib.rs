//! wklmux library.
//!
//! Serves the API server and etcd endpoints of many simulated workload
//! clusters from one process, one TCP port per cluster, choosing the TLS
//! certificate per handshake and routing each request to the right backend.

pub mod backend;
pub mod config;
pub mod debug;
pub mod error;
pub mod mux;
pub mod persistence;
pub mod registry;
pub mod server;

pub use backend::{ClusterResolver, InMemoryManager, Manager};
pub use error::{MuxError, Result};
pub use mux::{MuxConfig, WorkloadClustersMux};
pub use registry::{AdminCredentials, ClusterEndpoint, ListenerInfo};
