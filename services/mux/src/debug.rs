//! Debug and introspection endpoint.
//!
//! Served in cleartext on its own address, separate from the cluster
//! listeners. Intended for development and test harnesses.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{MuxError, Result};
use crate::registry::Registry;

/// Source of the data exposed on the debug endpoint.
#[async_trait]
pub trait DebugInfoProvider: Send + Sync {
    /// Cluster name to listener URL.
    async fn list_listeners(&self) -> BTreeMap<String, String>;
}

#[async_trait]
impl DebugInfoProvider for RwLock<Registry> {
    async fn list_listeners(&self) -> BTreeMap<String, String> {
        self.read().await.list_listeners()
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status: "ok".
    pub status: String,

    /// Service name.
    pub service: String,

    /// Service version.
    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,
}

/// Create the debug routes.
pub fn routes(provider: Arc<dyn DebugInfoProvider>) -> Router {
    Router::new()
        .route("/listeners", get(list_listeners))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(provider)
}

async fn list_listeners(State(provider): State<Arc<dyn DebugInfoProvider>>) -> impl IntoResponse {
    Json(provider.list_listeners().await)
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "wklmux".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Running debug server.
pub struct DebugServer {
    local_addr: SocketAddr,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

impl DebugServer {
    /// Bind `address` and start serving the debug routes.
    pub async fn bind(address: &str, provider: Arc<dyn DebugInfoProvider>) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = routes(provider);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(address = %local_addr, "Debug server listening");

        Ok(Self {
            local_addr,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for in-flight requests until `deadline`.
    pub async fn shutdown(&self, deadline: Instant) -> Result<()> {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        match timeout_at(deadline, handle).await {
            Ok(Ok(Ok(()))) => {
                info!("Debug server stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(MuxError::Shutdown {
                component: "debug server",
                source: e,
            }),
            Ok(Err(e)) => Err(MuxError::Shutdown {
                component: "debug server",
                source: io::Error::other(e),
            }),
            Err(_) => Err(MuxError::ShutdownTimeout("debug server")),
        }
    }
}
