//! Serve mode implementation for tlsrelay.
//!
//! This module owns the listening socket: it terminates TLS for every accepted
//! client and hands the connection to a new [`Session`]. Shutdown stops the
//! accept loop, cancels every session, and waits for them to finish.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::common::format_duration;
use crate::config::{BackendSecurity, ProxyConfig};
use crate::dialer::{Dialer, TlsDialer};
use crate::error::{Error, Result};
use crate::pump::RelaySettings;
use crate::session::Session;
use crate::tls::{build_server_config, load_cert_key, CertKeyPair};

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Runs the relay until Ctrl-C.
pub async fn run_server(config: ProxyConfig) -> Result<()> {
    let identity = load_cert_key(&config.identity.cert, &config.identity.key)?;
    let tls_config = build_server_config(&identity)?;
    let dialer = TlsDialer::new(config.backend.clone())?;

    let acceptor = Acceptor::bind(
        config.listen,
        Arc::new(tls_config),
        dialer,
        config.relay,
        config.handshake_timeout,
    )
    .await?;

    print_startup_message(&config, &identity, acceptor.local_addr()?);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received SIGINT, initiating graceful shutdown...");
                signal_token.cancel();
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for SIGINT"),
        }
    });

    acceptor.run(shutdown).await
}

fn print_startup_message(config: &ProxyConfig, identity: &CertKeyPair, local_addr: SocketAddr) {
    let verification = match &config.backend.security {
        BackendSecurity::Ca { ca: Some(path) } => format!("CA ({})", path.display()),
        BackendSecurity::Ca { ca: None } => "CA (web PKI roots)".to_string(),
        BackendSecurity::Fingerprint(_) => "fingerprint".to_string(),
        BackendSecurity::Insecure => "disabled".to_string(),
    };
    let max_frame = match config.relay.limits.max_frame_len {
        Some(max) => max.to_string(),
        None => "unlimited".to_string(),
    };

    eprintln!("Starting relay...");
    eprintln!("  Listen: {}", local_addr);
    eprintln!("  Backend: {}", config.backend.address);
    if let Some(sni) = &config.backend.sni {
        eprintln!("  Backend SNI: {}", sni);
    }
    eprintln!("  Backend Verification: {}", verification);
    eprintln!("  Mode: {}", config.relay.mode);
    eprintln!("  Max Frame Bytes: {}", max_frame);
    eprintln!("  Dial Timeout: {}", format_duration(config.backend.dial_timeout));
    eprintln!("  Handshake Timeout: {}", format_duration(config.handshake_timeout));
    eprintln!("  Fingerprint (SHA-256): {}", identity.fingerprint);
}

/// Accepts TLS clients and runs one session per connection.
pub struct Acceptor<D> {
    listener: TcpListener,
    tls: TlsAcceptor,
    dialer: Arc<D>,
    relay: RelaySettings,
    handshake_timeout: Duration,
}

impl<D> Acceptor<D>
where
    D: Dialer + 'static,
{
    /// Binds the listening socket.
    pub async fn bind(
        listen: SocketAddr,
        tls_config: Arc<ServerConfig>,
        dialer: D,
        relay: RelaySettings,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| Error::ListenFailed(format!("{}: {}", listen, e)))?;

        Ok(Self {
            listener,
            tls: TlsAcceptor::from(tls_config),
            dialer: Arc::new(dialer),
            relay,
            handshake_timeout,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` is cancelled, then waits for all
    /// sessions to close.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Relay listening on {}", self.local_addr()?);

        let tracker = TaskTracker::new();
        let mut next_id: u64 = 0;

        loop {
            let (tcp, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
                () = shutdown.cancelled() => break,
            };

            next_id += 1;
            let span = tracing::info_span!("session", id = next_id, %peer);
            tracker.spawn(
                handle_connection(
                    tcp,
                    peer,
                    next_id,
                    self.tls.clone(),
                    Arc::clone(&self.dialer),
                    self.relay,
                    self.handshake_timeout,
                    shutdown.clone(),
                )
                .instrument(span),
            );
        }

        drop(self.listener);
        tracker.close();
        if !tracker.is_empty() {
            tracing::info!(sessions = tracker.len(), "waiting for sessions to close");
        }
        tracker.wait().await;

        tracing::info!("Relay shutdown complete");
        Ok(())
    }
}

/// Terminates TLS for one client and runs its session.
#[allow(clippy::too_many_arguments)]
async fn handle_connection<D: Dialer>(
    tcp: TcpStream,
    peer: SocketAddr,
    id: u64,
    tls: TlsAcceptor,
    dialer: Arc<D>,
    relay: RelaySettings,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!("client connected");
    if let Err(e) = tcp.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY on client socket");
    }

    let handshake = tokio::time::timeout(handshake_timeout, tls.accept(tcp));
    let client = tokio::select! {
        result = handshake => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "client TLS handshake failed");
                return;
            }
            Err(_) => {
                tracing::warn!(
                    timeout = %format_duration(handshake_timeout),
                    "client TLS handshake timed out"
                );
                return;
            }
        },
        () = shutdown.cancelled() => return,
    };

    let session = Session::new(id, peer, relay, &shutdown);
    session.run(client, dialer.as_ref()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DialError;
    use crate::tls::generate_self_signed_cert;
    use tokio::io::AsyncReadExt;
    use tokio::io::DuplexStream;

    const WAIT: Duration = Duration::from_secs(5);

    struct UnreachableDialer;

    impl Dialer for UnreachableDialer {
        type Conn = DuplexStream;

        async fn dial(&self) -> std::result::Result<DuplexStream, DialError> {
            Err(DialError::Other("no backend in this test".to_string()))
        }
    }

    fn server_config() -> Arc<ServerConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let identity = generate_self_signed_cert(&["localhost".to_string()])
            .unwrap()
            .to_identity()
            .unwrap();
        Arc::new(build_server_config(&identity).unwrap())
    }

    async fn bind(handshake_timeout: Duration) -> Acceptor<UnreachableDialer> {
        Acceptor::bind(
            "127.0.0.1:0".parse().unwrap(),
            server_config(),
            UnreachableDialer,
            RelaySettings::default(),
            handshake_timeout,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let acceptor = bind(Duration::from_secs(10)).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(acceptor.run(shutdown.clone()));

        shutdown.cancel();
        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let first = bind(Duration::from_secs(10)).await;
        let addr = first.local_addr().unwrap();

        let second = Acceptor::bind(
            addr,
            server_config(),
            UnreachableDialer,
            RelaySettings::default(),
            Duration::from_secs(10),
        )
        .await;
        assert!(matches!(second, Err(Error::ListenFailed(_))));
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes_connection() {
        let acceptor = bind(Duration::from_millis(200)).await;
        let addr = acceptor.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(acceptor.run(shutdown.clone()));

        // Connect but never send a ClientHello.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        tokio::time::timeout(WAIT, stream.read_to_end(&mut buf))
            .await
            .expect("server did not drop the stalled handshake")
            .unwrap();
        assert!(buf.is_empty());

        shutdown.cancel();
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_handshake() {
        let acceptor = bind(Duration::from_secs(60)).await;
        let addr = acceptor.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(acceptor.run(shutdown.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Give the accept loop a moment to pick the connection up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        let mut buf = Vec::new();
        tokio::time::timeout(WAIT, stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
    }
}
