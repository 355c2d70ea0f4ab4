//! Outbound connections to the backend.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::common::{parse_connect_address, DnsResolver};
use crate::config::BackendConfig;
use crate::error::Result;
use crate::tls::build_client_config;

/// Reasons a backend dial can fail. All of them end the session.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to resolve backend address: {0}")]
    Resolve(String),

    #[error("invalid TLS server name '{0}'")]
    InvalidServerName(String),

    #[error("TCP connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("backend dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Establishes the backend side of a session.
pub trait Dialer: Send + Sync {
    /// Connection type handed to the session.
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Opens a new connection to the backend.
    fn dial(&self) -> impl Future<Output = std::result::Result<Self::Conn, DialError>> + Send;
}

/// Dials the backend over TCP and wraps the connection in TLS.
pub struct TlsDialer {
    config: BackendConfig,
    connector: TlsConnector,
    resolver: DnsResolver,
}

impl TlsDialer {
    /// Builds a dialer, preparing the rustls client configuration up front.
    pub fn new(config: BackendConfig) -> Result<Self> {
        let tls_config = build_client_config(&config.security)?;
        Ok(Self {
            config,
            connector: TlsConnector::from(Arc::new(tls_config)),
            resolver: DnsResolver::new(),
        })
    }

    async fn connect(&self) -> std::result::Result<TlsStream<TcpStream>, DialError> {
        let (addr, sni) = parse_connect_address(
            &self.config.address,
            self.config.sni.as_deref(),
            &self.resolver,
        )
        .await
        .map_err(|e| DialError::Resolve(e.to_string()))?;

        let server_name =
            ServerName::try_from(sni.clone()).map_err(|_| DialError::InvalidServerName(sni))?;

        tracing::debug!(%addr, "dialing backend");
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| DialError::Connect { addr, source })?;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY on backend socket");
        }

        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|source| DialError::Handshake { addr, source })?;

        tracing::debug!(%addr, "backend TLS established");
        Ok(tls)
    }
}

impl Dialer for TlsDialer {
    type Conn = TlsStream<TcpStream>;

    async fn dial(&self) -> std::result::Result<Self::Conn, DialError> {
        let timeout = self.config.dial_timeout;
        tokio::time::timeout(timeout, self.connect())
            .await
            .map_err(|_| DialError::Timeout(timeout))?
    }
}
