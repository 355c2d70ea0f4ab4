//! Error types for tlsrelay.

use thiserror::Error;

use crate::tls::TlsError;

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Invalid arguments or configuration
    ConfigInvalid = 2,
    /// Listen failed
    ListenFailed = 10,
    /// Certificate or TLS setup failed
    TlsSetupFailed = 12,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for tlsrelay.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Config(_) => ExitCode::ConfigInvalid,
            Error::ListenFailed(_) => ExitCode::ListenFailed,
            Error::Tls(_) => ExitCode::TlsSetupFailed,
            Error::Io(_) => ExitCode::ListenFailed,
        }
    }
}

/// Result type alias for tlsrelay operations.
pub type Result<T> = std::result::Result<T, Error>;
