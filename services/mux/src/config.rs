//! Multiplexer process configuration.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use wklmux_networking::{PortRange, DEFAULT_MAX_PORT, DEFAULT_MIN_PORT};

use crate::mux::{MuxConfig, DEFAULT_DEBUG_ADDRESS};
use crate::server::DEFAULT_MAX_CONNECTIONS;

/// Process configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Host every cluster listener binds to.
    pub host: String,

    /// Ports handed out to clusters.
    pub port_range: PortRange,

    /// Address of the debug endpoint.
    pub debug_addr: String,

    /// Maximum concurrent connections across all clusters.
    pub max_connections: usize,

    /// Optional file the cluster endpoints are persisted to.
    pub state_file: Option<PathBuf>,

    /// Clusters to create at startup, each with one API server and one etcd
    /// member.
    pub bootstrap_clusters: Vec<String>,

    /// Optional file the bootstrap CA certificate is written to.
    pub ca_cert_file: Option<PathBuf>,

    /// How long shutdown waits for connections to drain.
    pub shutdown_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("WKLMUX_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let min_port: u16 = std::env::var("WKLMUX_MIN_PORT")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("WKLMUX_MIN_PORT must be a port number.")?
            .unwrap_or(DEFAULT_MIN_PORT);

        let max_port: u16 = std::env::var("WKLMUX_MAX_PORT")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("WKLMUX_MAX_PORT must be a port number.")?
            .unwrap_or(DEFAULT_MAX_PORT);

        // WKLMUX_PORT_RANGE ("min-max") takes precedence over the separate bounds.
        let port_range = match std::env::var("WKLMUX_PORT_RANGE") {
            Ok(range) => PortRange::parse(&range).context("Invalid WKLMUX_PORT_RANGE")?,
            Err(_) => PortRange::new(min_port, max_port)
                .context("Invalid WKLMUX_MIN_PORT/WKLMUX_MAX_PORT")?,
        };

        let debug_addr =
            std::env::var("WKLMUX_DEBUG_ADDR").unwrap_or_else(|_| DEFAULT_DEBUG_ADDRESS.to_string());

        let max_connections: usize = std::env::var("WKLMUX_MAX_CONNECTIONS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("WKLMUX_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let state_file = std::env::var("WKLMUX_STATE_FILE").ok().map(PathBuf::from);

        let bootstrap_clusters = std::env::var("WKLMUX_BOOTSTRAP_CLUSTERS")
            .map(|v| parse_list(&v))
            .unwrap_or_default();

        let ca_cert_file = std::env::var("WKLMUX_CA_CERT_FILE").ok().map(PathBuf::from);

        let shutdown_timeout_ms: u64 = std::env::var("WKLMUX_SHUTDOWN_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("WKLMUX_SHUTDOWN_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(10_000);

        let log_level = std::env::var("WKLMUX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            host,
            port_range,
            debug_addr,
            max_connections,
            state_file,
            bootstrap_clusters,
            ca_cert_file,
            shutdown_timeout: Duration::from_millis(shutdown_timeout_ms),
            log_level,
        })
    }

    /// Settings for the multiplexer itself.
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            host: self.host.clone(),
            port_range: self.port_range,
            debug_address: self.debug_addr.clone(),
            max_connections: self.max_connections,
        }
    }
}

/// Split a comma separated list, dropping empty entries.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
