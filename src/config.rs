//! Immutable runtime configuration built from command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::ServeArgs;
use crate::error::{Error, Result};
use crate::frame::FrameLimits;
use crate::pump::{RelayMode, RelaySettings};
use crate::tls::parse_fingerprint;

/// Everything the acceptor and dialer need to run.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to accept TLS clients on.
    pub listen: SocketAddr,
    /// Server certificate and key.
    pub identity: IdentityConfig,
    /// Upstream the sessions relay to.
    pub backend: BackendConfig,
    /// Relay strategy and frame limits.
    pub relay: RelaySettings,
    /// Upper bound on the inbound TLS handshake.
    pub handshake_timeout: Duration,
}

/// Paths to the server TLS identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Backend address and TLS verification policy.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// `host:port` of the backend.
    pub address: String,
    /// SNI override; defaults to the host part of `address`.
    pub sni: Option<String>,
    pub security: BackendSecurity,
    pub dial_timeout: Duration,
}

/// How the backend's certificate is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSecurity {
    /// CA validation against a custom root or the bundled web PKI roots.
    Ca { ca: Option<PathBuf> },
    /// SHA-256 pin of the end-entity certificate.
    Fingerprint([u8; 32]),
    /// No verification (development only).
    Insecure,
}

impl ProxyConfig {
    /// Validates `args` and converts them into a configuration.
    pub fn from_args(args: &ServeArgs) -> Result<Self> {
        let listen = parse_listen_address(&args.listen)?;

        let mode: RelayMode = args.mode.parse().map_err(Error::Config)?;
        let limits = FrameLimits {
            max_frame_len: (args.max_frame_bytes != 0).then_some(args.max_frame_bytes),
        };

        Ok(Self {
            listen,
            identity: IdentityConfig {
                cert: args.cert.clone(),
                key: args.key.clone(),
            },
            backend: BackendConfig {
                address: args.server.clone(),
                sni: args.sni.clone(),
                security: backend_security(args)?,
                dial_timeout: args.dial_timeout,
            },
            relay: RelaySettings { mode, limits },
            handshake_timeout: args.handshake_timeout,
        })
    }
}

/// Insecure mode takes precedence over a fingerprint, which takes precedence over CA roots.
fn backend_security(args: &ServeArgs) -> Result<BackendSecurity> {
    if args.insecure_skip_verify {
        return Ok(BackendSecurity::Insecure);
    }
    if let Some(fp) = args.fingerprint.as_deref() {
        let fingerprint = parse_fingerprint(fp)
            .map_err(|e| Error::Config(format!("invalid --fingerprint: {}", e)))?;
        return Ok(BackendSecurity::Fingerprint(fingerprint));
    }
    Ok(BackendSecurity::Ca {
        ca: args.ca.clone(),
    })
}

/// Parses a listen address string into a SocketAddr.
pub fn parse_listen_address(listen: &str) -> Result<SocketAddr> {
    // Handle ":port" format by prepending "0.0.0.0"
    let addr_str = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };

    addr_str
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", listen, e)))
}
