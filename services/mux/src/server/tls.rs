//! TLS termination with per-handshake certificate selection.
//!
//! The ClientHello is read before a server configuration exists, so the
//! certificate can be picked from the registry by the listener's address and
//! the requested server name.

use std::io;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

use crate::registry::SharedRegistry;

/// TLS record content type for handshake messages.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// ALPN protocols offered to clients, in preference order.
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Check whether the first byte of a connection starts a TLS handshake.
pub fn is_tls_handshake(first_byte: u8) -> bool {
    first_byte == TLS_HANDSHAKE_RECORD
}

/// Always serves the certificate picked for this handshake.
#[derive(Debug)]
struct SelectedCertificate(Arc<CertifiedKey>);

impl ResolvesServerCert for SelectedCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Terminates TLS for every cluster listener.
#[derive(Clone)]
pub struct TlsTerminator {
    registry: SharedRegistry,
    provider: Arc<CryptoProvider>,
}

impl TlsTerminator {
    pub fn new(registry: SharedRegistry) -> Self {
        Self {
            registry,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Build the server configuration for one handshake.
    pub fn server_config(&self, key: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>, rustls::Error> {
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SelectedCertificate(key)));
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
        Ok(Arc::new(config))
    }

    /// Complete the server side of a handshake accepted on `listener`
    /// (the listener's `host:port`).
    pub async fn accept<IO>(&self, io: IO, listener: &str) -> io::Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), io).await?;
        let server_name = start.client_hello().server_name().map(str::to_string);

        let resolved = {
            let registry = self.registry.read().await;
            registry.resolve_certificate(listener, server_name.as_deref())
        };

        let key = resolved.map_err(|e| {
            warn!(
                address = %listener,
                server_name = ?server_name,
                error = %e,
                "Failed to resolve serving certificate"
            );
            io::Error::other(e)
        })?;

        debug!(address = %listener, server_name = ?server_name, "Serving certificate selected");

        let config = self.server_config(key).map_err(io::Error::other)?;
        start.into_stream(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_tls_handshake() {
        assert!(is_tls_handshake(0x16));
        assert!(!is_tls_handshake(b'G'));
        assert!(!is_tls_handshake(b'P'));
    }
}
