//! CLI definitions for tlsrelay.

use clap::{builder::PossibleValuesParser, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::frame::DEFAULT_MAX_FRAME_LEN;
use crate::pump::RelayMode;

/// Default local listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:9000";

/// Default certificate path.
pub const DEFAULT_CERT_PATH: &str = "./cert.pem";

/// Default private key path.
pub const DEFAULT_KEY_PATH: &str = "./key.pem";

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// TLS-terminating relay with length-prefixed frame forwarding.
#[derive(Debug, Parser)]
#[command(name = "tlsrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept TLS clients and relay them to a TLS backend
    Serve(ServeArgs),

    /// Write a self-signed certificate and key for development
    GenCert(GenCertArgs),

    /// Show version information
    Version,
}

/// Arguments for the serve subcommand.
#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Local listen address (e.g., 127.0.0.1:9000 or :9000)
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Backend address to relay to (e.g., backend.example.com:9001)
    #[arg(long)]
    pub server: String,

    /// TLS certificate file path
    #[arg(long, default_value = DEFAULT_CERT_PATH)]
    pub cert: PathBuf,

    /// TLS private key file path
    #[arg(long, default_value = DEFAULT_KEY_PATH)]
    pub key: PathBuf,

    /// Relay strategy
    #[arg(long, default_value = "framed", value_parser = PossibleValuesParser::new(RelayMode::NAMES))]
    pub mode: String,

    /// Largest accepted frame in bytes, header included (0 for no limit)
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: u32,

    /// TLS SNI hostname for the backend
    #[arg(long)]
    pub sni: Option<String>,

    /// Root CA certificate file for verifying the backend
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Disable backend certificate verification (development only)
    #[arg(long, default_value_t = false)]
    pub insecure_skip_verify: bool,

    /// Backend certificate fingerprint (SHA-256 hex)
    #[arg(long)]
    pub fingerprint: Option<String>,

    /// Backend dial timeout, TLS handshake included
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub dial_timeout: Duration,

    /// Inbound TLS handshake timeout
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub handshake_timeout: Duration,
}

/// Arguments for the gen-cert subcommand.
#[derive(Debug, Parser)]
pub struct GenCertArgs {
    /// Certificate output path
    #[arg(long, default_value = DEFAULT_CERT_PATH)]
    pub cert: PathBuf,

    /// Private key output path
    #[arg(long, default_value = DEFAULT_KEY_PATH)]
    pub key: PathBuf,

    /// Subject alternative names (repeatable)
    #[arg(long = "host", default_value = "localhost")]
    pub hosts: Vec<String>,

    /// Overwrite existing files
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("TLSRELAY_COMMIT").unwrap_or("unknown"),
            built: option_env!("TLSRELAY_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "tlsrelay version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve_minimal() {
        let cli = Cli::try_parse_from(["tlsrelay", "serve", "--server", "10.0.0.5:9001"]).unwrap();

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.listen, DEFAULT_LISTEN);
                assert_eq!(args.server, "10.0.0.5:9001");
                assert_eq!(args.cert, PathBuf::from(DEFAULT_CERT_PATH));
                assert_eq!(args.key, PathBuf::from(DEFAULT_KEY_PATH));
                assert_eq!(args.mode, "framed");
                assert_eq!(args.max_frame_bytes, DEFAULT_MAX_FRAME_LEN);
                assert!(args.sni.is_none());
                assert!(args.ca.is_none());
                assert!(!args.insecure_skip_verify);
                assert!(args.fingerprint.is_none());
                assert_eq!(args.dial_timeout, Duration::from_secs(10));
                assert_eq!(args.handshake_timeout, Duration::from_secs(10));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_parse_serve_full() {
        let cli = Cli::try_parse_from([
            "tlsrelay",
            "--log-level",
            "debug",
            "serve",
            "--listen",
            ":9443",
            "--server",
            "backend.internal:9001",
            "--cert",
            "/path/to/cert.pem",
            "--key",
            "/path/to/key.pem",
            "--mode",
            "line",
            "--max-frame-bytes",
            "4096",
            "--sni",
            "api.internal",
            "--ca",
            "/path/to/ca.pem",
            "--dial-timeout",
            "1m30s",
            "--handshake-timeout",
            "500ms",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.listen, ":9443");
                assert_eq!(args.server, "backend.internal:9001");
                assert_eq!(args.cert, PathBuf::from("/path/to/cert.pem"));
                assert_eq!(args.key, PathBuf::from("/path/to/key.pem"));
                assert_eq!(args.mode, "line");
                assert_eq!(args.max_frame_bytes, 4096);
                assert_eq!(args.sni, Some("api.internal".to_string()));
                assert_eq!(args.ca, Some(PathBuf::from("/path/to/ca.pem")));
                assert_eq!(args.dial_timeout, Duration::from_secs(90));
                assert_eq!(args.handshake_timeout, Duration::from_millis(500));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_missing_server() {
        let result = Cli::try_parse_from(["tlsrelay", "serve"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_serve_rejects_unknown_mode() {
        let result = Cli::try_parse_from([
            "tlsrelay", "serve", "--server", "a:1", "--mode", "udp",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_gen_cert_defaults() {
        let cli = Cli::try_parse_from(["tlsrelay", "gen-cert"]).unwrap();
        match cli.command {
            Command::GenCert(args) => {
                assert_eq!(args.cert, PathBuf::from(DEFAULT_CERT_PATH));
                assert_eq!(args.key, PathBuf::from(DEFAULT_KEY_PATH));
                assert_eq!(args.hosts, vec!["localhost".to_string()]);
                assert!(!args.force);
            }
            _ => panic!("Expected GenCert command"),
        }
    }

    #[test]
    fn test_parse_gen_cert_hosts() {
        let cli = Cli::try_parse_from([
            "tlsrelay",
            "gen-cert",
            "--host",
            "relay.example.com",
            "--host",
            "127.0.0.1",
            "--force",
        ])
        .unwrap();
        match cli.command {
            Command::GenCert(args) => {
                assert_eq!(args.hosts, vec!["relay.example.com", "127.0.0.1"]);
                assert!(args.force);
            }
            _ => panic!("Expected GenCert command"),
        }
    }

    #[test]
    fn test_parse_version() {
        let cli = Cli::try_parse_from(["tlsrelay", "version"]).unwrap();
        assert!(matches!(cli.command, Command::Version));
    }

    #[test]
    fn test_build_info_format() {
        let info = BuildInfo {
            version: "1.0.0",
            commit: "abc1234",
            built: "2025-01-01T00:00:00Z",
        };
        let output = info.format();
        assert!(output.contains("tlsrelay version 1.0.0"));
        assert!(output.contains("commit: abc1234"));
        assert!(output.contains("built:  2025-01-01T00:00:00Z"));
    }
}
