//! Multiplexed HTTPS server.
//!
//! One accept loop runs per bound cluster socket. Each accepted connection
//! gets its own task: the first byte decides between TLS (certificate picked
//! per handshake) and cleartext, then the connection is served as HTTP/1.1
//! or HTTP/2 and every request is demultiplexed between the API server and
//! etcd backends.
//!
//! Shutdown is broadcast over a watch channel. Every accept loop and
//! connection task holds a clone of the drain sender, so the drain receiver
//! yields `None` once all of them have finished.

pub mod demux;
pub mod tls;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::http::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{MuxError, Result};
use crate::registry::SharedRegistry;

pub use demux::{classify, ListenerAddress, MixedHandler, Protocol};
pub use tls::TlsTerminator;

/// Default maximum concurrent connections across all listeners.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Bind a cluster socket.
///
/// The bind is synchronous so it can run while the registry write lock is
/// held; the returned listener must be used from within the runtime.
pub fn bind(address: &str) -> io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// State shared by every accept loop and connection task.
struct ConnectionContext {
    handler: MixedHandler,
    tls: TlsTerminator,
    conn_semaphore: Arc<Semaphore>,
}

/// Serves every cluster socket of the multiplexer.
pub struct MuxServer {
    ctx: Arc<ConnectionContext>,
    shutdown_tx: watch::Sender<bool>,
    drain_tx: Mutex<Option<mpsc::Sender<()>>>,
    drain_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl MuxServer {
    pub fn new(registry: SharedRegistry, handler: MixedHandler, max_connections: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (drain_tx, drain_rx) = mpsc::channel(1);

        Self {
            ctx: Arc::new(ConnectionContext {
                handler,
                tls: TlsTerminator::new(registry),
                conn_semaphore: Arc::new(Semaphore::new(max_connections)),
            }),
            shutdown_tx,
            drain_tx: Mutex::new(Some(drain_tx)),
            drain_rx: tokio::sync::Mutex::new(drain_rx),
        }
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Start serving `listener` for `cluster`.
    ///
    /// `address` is the `host:port` the cluster is registered under. Returns
    /// once the accept loop is running.
    pub async fn serve(&self, cluster: &str, address: &str, listener: TcpListener) -> Result<()> {
        let drain = self
            .drain_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(MuxError::ShuttingDown)?;

        let accept_loop = AcceptLoop {
            listener,
            address: address.to_string(),
            ctx: Arc::clone(&self.ctx),
            shutdown: self.shutdown_tx.subscribe(),
            drain,
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(
            accept_loop
                .run(ready_tx)
                .instrument(tracing::info_span!("listener", cluster = %cluster, address = %address)),
        );

        ready_rx.await.map_err(|_| MuxError::ShuttingDown)
    }

    /// Stop every accept loop and drain open connections.
    ///
    /// In-flight requests are allowed to complete; idle connections are
    /// closed. Fails with `ShutdownTimeout` if tasks are still running at
    /// `deadline`. Calling it again is harmless.
    pub async fn shutdown(&self, deadline: Instant) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        drop(
            self.drain_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let mut drain_rx = self.drain_rx.lock().await;
        match timeout_at(deadline, drain_rx.recv()).await {
            Ok(_) => {
                info!("Workload clusters server stopped");
                Ok(())
            }
            Err(_) => Err(MuxError::ShutdownTimeout("workload clusters server")),
        }
    }
}

struct AcceptLoop {
    listener: TcpListener,
    address: String,
    ctx: Arc<ConnectionContext>,
    shutdown: watch::Receiver<bool>,
    drain: mpsc::Sender<()>,
}

impl AcceptLoop {
    async fn run(mut self, ready: oneshot::Sender<()>) {
        let _ = ready.send(());
        info!("Listener started");

        loop {
            if *self.shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        info!("Listener stopped");
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let Ok(permit) = Arc::clone(&self.ctx.conn_semaphore).try_acquire_owned() else {
            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
            return;
        };

        let ctx = Arc::clone(&self.ctx);
        let address = self.address.clone();
        let shutdown = self.shutdown.clone();
        let drain = self.drain.clone();

        tokio::spawn(
            async move {
                if let Err(e) = serve_connection(ctx, stream, address, shutdown).await {
                    debug!(error = %e, "Connection error");
                }
                drop(permit);
                drop(drain);
            }
            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
        );
    }
}

async fn serve_connection(
    ctx: Arc<ConnectionContext>,
    stream: TcpStream,
    address: String,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let mut first = [0u8; 1];
    let read = tokio::select! {
        read = stream.peek(&mut first) => read?,
        _ = shutdown.changed() => return Ok(()),
    };
    if read == 0 {
        return Ok(());
    }

    if tls::is_tls_handshake(first[0]) {
        let tls_stream = tokio::select! {
            accepted = ctx.tls.accept(stream, &address) => accepted?,
            _ = shutdown.changed() => return Ok(()),
        };
        serve_http(&ctx.handler, tls_stream, address, shutdown).await
    } else {
        debug!("Serving cleartext connection");
        serve_http(&ctx.handler, stream, address, shutdown).await
    }
}

async fn serve_http<IO>(
    handler: &MixedHandler,
    io: IO,
    address: String,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = handler.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let address = address.clone();
        async move { handler.handle(req, &address).await }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let served = tokio::select! {
        served = conn.as_mut() => served,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    served.map_err(io::Error::other)
}
