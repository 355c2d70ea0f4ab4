//! tlsrelay - TLS-terminating relay for length-prefixed frame protocols.
//!
//! Each accepted TLS client gets its own session: the relay dials a TLS
//! backend, then forwards whole frames in both directions until either side
//! closes. Frames are a 4-byte big-endian total length (header included)
//! followed by the payload.

pub mod cli;
pub mod common;
pub mod config;
pub mod dialer;
pub mod error;
pub mod frame;
pub mod pump;
pub mod server;
pub mod session;
pub mod tls;

pub use cli::{BuildInfo, Cli, Command, GenCertArgs, ServeArgs};
pub use common::{format_duration, parse_connect_address, DnsResolver, READ_BUFFER_SIZE};
pub use config::{BackendConfig, BackendSecurity, IdentityConfig, ProxyConfig};
pub use dialer::{DialError, Dialer, TlsDialer};
pub use error::{Error, ExitCode, Result};
pub use frame::{
    read_frame, read_frame_with_limits, write_frame, Frame, FrameError, FrameLimits,
    ProtocolError, ProtocolResult, DEFAULT_MAX_FRAME_LEN, HEADER_LEN,
};
pub use pump::{Direction, Pump, PumpReport, RelayMode, RelaySettings, Termination};
pub use server::{run_server, Acceptor};
pub use session::{Session, SessionOutcome, SessionReport, SessionState};
pub use tls::{
    build_client_config, build_server_config, compute_fingerprint, format_fingerprint,
    generate_self_signed_cert, load_cert_key, parse_fingerprint, write_self_signed_cert,
    CertKeyPair, GeneratedCert, TlsError, TlsResult,
};
