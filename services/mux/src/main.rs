//! wklmux
//!
//! Serves the API server and etcd endpoints of simulated workload clusters.
//!
//! This binary:
//! - Restores cluster ports from the state file (hot restart)
//! - Optionally bootstraps a set of clusters with a fresh CA
//! - Serves the debug endpoint until interrupted
//! - Saves cluster endpoints on shutdown

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wklmux::config::Config;
use wklmux::persistence::StatePersistence;
use wklmux::{InMemoryManager, WorkloadClustersMux};
use wklmux_pki::CertificateAuthority;

/// Identity of the API server created for bootstrap clusters.
const BOOTSTRAP_API_SERVER: &str = "kube-apiserver-0";

/// Identity of the etcd member created for bootstrap clusters.
const BOOTSTRAP_ETCD_MEMBER: &str = "etcd-0";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to WKLMUX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting wklmux");
    info!(
        host = %config.host,
        port_range = %config.port_range,
        debug_addr = %config.debug_addr,
        "Configuration loaded"
    );

    let manager = Arc::new(InMemoryManager::new());
    let mux = WorkloadClustersMux::new(config.mux_config(), manager.clone())
        .await
        .context("Failed to start the workload clusters multiplexer")?;

    let persistence = config.state_file.clone().map(StatePersistence::new);
    if let Some(persistence) = &persistence {
        let state = persistence.load()?;
        for cluster in &state.clusters {
            manager.add_resource_group(&cluster.name);
        }

        let restored = mux
            .hot_restart(&state.clusters)
            .await
            .context("Failed to hot restart the workload clusters multiplexer")?;
        info!(restored, "Cluster endpoints restored");
    }

    bootstrap(&config, &mux, &manager).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Received shutdown signal");

    let deadline = Instant::now() + config.shutdown_timeout;
    let shutdown = mux.shutdown(deadline).await;

    if let Some(persistence) = &persistence {
        if let Err(e) = persistence.save(&config.host, mux.endpoints().await) {
            error!(error = %e, "Failed to save cluster endpoints");
        }
    }

    shutdown.context("Failed to shutdown the workload clusters multiplexer")?;
    info!("Shutdown complete");
    Ok(())
}

/// Create the configured bootstrap clusters, each with one API server and
/// one etcd member signed by a fresh CA.
async fn bootstrap(
    config: &Config,
    mux: &WorkloadClustersMux,
    manager: &InMemoryManager,
) -> Result<()> {
    if config.bootstrap_clusters.is_empty() {
        return Ok(());
    }

    let ca = CertificateAuthority::new("wklmux-ca").context("Failed to create the bootstrap CA")?;
    if let Some(path) = &config.ca_cert_file {
        std::fs::write(path, ca.cert_pem())
            .with_context(|| format!("Failed to write CA certificate: {}", path.display()))?;
    }

    for cluster in &config.bootstrap_clusters {
        manager.add_resource_group(cluster);

        let listener = mux.init_listener(cluster).await?;
        mux.add_etcd_member(cluster, BOOTSTRAP_ETCD_MEMBER, &ca).await?;
        mux.add_api_server(cluster, BOOTSTRAP_API_SERVER, &ca).await?;

        info!(
            cluster = %cluster,
            address = %listener.address(),
            "Workload cluster bootstrapped"
        );
    }

    Ok(())
}
