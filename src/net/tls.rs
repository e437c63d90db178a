//! TLS client configuration for registry sockets.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{AppError, AppResult};

/// Connector trusting the Mozilla root set, with the ring provider.
pub fn connector() -> AppResult<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| AppError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the client handshake over an established TCP stream, using `host` for SNI
/// and certificate verification.
pub async fn handshake(
    connector: &TlsConnector,
    host: &str,
    stream: TcpStream,
) -> AppResult<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| AppError::Tls(format!("invalid server name '{}': {}", host, e)))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| AppError::Tls(format!("handshake with {} failed: {}", host, e)))
}
