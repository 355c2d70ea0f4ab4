//! TLS/certificate handling for tlsrelay.
//!
//! This module provides:
//! - Server identity loading from PEM files
//! - Self-signed certificate generation (ECDSA P-256) for `gen-cert`
//! - SHA-256 fingerprint computation and parsing
//! - rustls configuration builders for the listener and the backend dialer

use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::BackendSecurity;

/// Error type for TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} already exists (use --force to overwrite)")]
    FileExists(PathBuf),

    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

/// Result type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// Certificate chain and private key with the leaf's fingerprint.
#[derive(Debug)]
pub struct CertKeyPair {
    /// Certificate chain, leaf first.
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// SHA-256 fingerprint of the leaf certificate (colon-separated hex).
    pub fingerprint: String,
}

/// PEM output of [`generate_self_signed_cert`].
pub struct GeneratedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub fingerprint: String,
}

/// Generates a self-signed ECDSA P-256 certificate valid for `hosts`.
///
/// IP literals become IP subject alternative names, everything else a DNS name.
pub fn generate_self_signed_cert(hosts: &[String]) -> TlsResult<GeneratedCert> {
    if hosts.is_empty() {
        return Err(TlsError::CertificateGeneration(
            "at least one host name is required".to_string(),
        ));
    }

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

    let mut params = CertificateParams::new(hosts.to_vec())
        .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;
    params
        .distinguished_name
        .push(DnType::CommonName, hosts[0].as_str());

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(365);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        fingerprint: compute_fingerprint(cert.der()),
    })
}

/// Generates a self-signed certificate and writes it to `cert_path` and `key_path`.
///
/// Existing files are left untouched unless `force` is set. The key file is
/// restricted to owner read/write on Unix.
pub fn write_self_signed_cert(
    cert_path: &Path,
    key_path: &Path,
    hosts: &[String],
    force: bool,
) -> TlsResult<CertKeyPair> {
    if !force {
        for path in [cert_path, key_path] {
            if path.exists() {
                return Err(TlsError::FileExists(path.to_path_buf()));
            }
        }
    }

    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
    }

    let generated = generate_self_signed_cert(hosts)?;

    fs::write(cert_path, &generated.cert_pem)?;
    fs::write(key_path, &generated.key_pem)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
    }

    generated.to_identity()
}

impl GeneratedCert {
    /// Parses the generated PEM documents into an identity usable by rustls.
    pub fn to_identity(&self) -> TlsResult<CertKeyPair> {
        Ok(CertKeyPair {
            certs: parse_cert_pem(&self.cert_pem)?,
            key: parse_key_pem(&self.key_pem)?,
            fingerprint: self.fingerprint.clone(),
        })
    }
}

/// Loads a certificate chain and private key from PEM files.
pub fn load_cert_key(cert_path: &Path, key_path: &Path) -> TlsResult<CertKeyPair> {
    let cert_pem = read_pem(cert_path)?;
    let key_pem = read_pem(key_path)?;

    let certs = parse_cert_pem(&cert_pem)?;
    let key = parse_key_pem(&key_pem)?;
    let fingerprint = compute_fingerprint(&certs[0]);

    Ok(CertKeyPair {
        certs,
        key,
        fingerprint,
    })
}

fn read_pem(path: &Path) -> TlsResult<String> {
    fs::read_to_string(path).map_err(|source| TlsError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses PEM-encoded certificates. Fails if none are present.
fn parse_cert_pem(pem: &str) -> TlsResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate(
            "no certificates found in PEM".to_string(),
        ));
    }

    Ok(certs)
}

/// Parses the first PKCS#1, PKCS#8 or SEC1 private key in a PEM document.
fn parse_key_pem(pem: &str) -> TlsResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::InvalidKey(e.to_string()))?
        .ok_or_else(|| TlsError::InvalidKey("no private key found in PEM".to_string()))
}

/// Computes the SHA-256 fingerprint of a DER-encoded certificate.
///
/// Returns the fingerprint in colon-separated lowercase hex format.
pub fn compute_fingerprint(cert_der: &[u8]) -> String {
    format_fingerprint(&sha256(cert_der))
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Parses a fingerprint string in either colon-separated or continuous hex format.
///
/// Both formats are accepted (case-insensitive):
/// - Colon-separated: `aa:bb:cc:dd:...` (95 characters for 32 bytes)
/// - Continuous hex: `aabbccdd...` (64 characters)
pub fn parse_fingerprint(s: &str) -> TlsResult<[u8; 32]> {
    let s = s.trim();

    let hex_str = if s.contains(':') {
        if s.len() != 95 {
            return Err(TlsError::InvalidFingerprint(format!(
                "colon-separated fingerprint must be 95 characters, got {}",
                s.len()
            )));
        }
        if let Some((i, part)) = s.split(':').enumerate().find(|(_, p)| p.len() != 2) {
            return Err(TlsError::InvalidFingerprint(format!(
                "byte {} has invalid length: expected 2, got {}",
                i,
                part.len()
            )));
        }
        s.replace(':', "")
    } else {
        if s.len() != 64 {
            return Err(TlsError::InvalidFingerprint(format!(
                "continuous hex fingerprint must be 64 characters, got {}",
                s.len()
            )));
        }
        s.to_string()
    };

    let mut result = [0u8; 32];
    for (i, chunk) in hex_str.as_bytes().chunks(2).enumerate() {
        let hex_pair = std::str::from_utf8(chunk)
            .map_err(|_| TlsError::InvalidFingerprint("invalid UTF-8 in fingerprint".to_string()))?;
        result[i] = u8::from_str_radix(hex_pair, 16).map_err(|_| {
            TlsError::InvalidFingerprint(format!("invalid hex character in fingerprint: {}", hex_pair))
        })?;
    }

    Ok(result)
}

/// Formats a fingerprint as colon-separated lowercase hex.
pub fn format_fingerprint(bytes: &[u8; 32]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Builds the listener's TLS configuration. No client authentication.
pub fn build_server_config(identity: &CertKeyPair) -> TlsResult<ServerConfig> {
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(identity.certs.clone(), identity.key.clone_key())
        .map_err(|e| TlsError::TlsConfig(e.to_string()))
}

/// Builds the backend dialer's TLS configuration for the given verification mode.
pub fn build_client_config(security: &BackendSecurity) -> TlsResult<ClientConfig> {
    match security {
        BackendSecurity::Ca { ca } => build_client_config_ca(ca.as_deref()),
        BackendSecurity::Fingerprint(fingerprint) => build_client_config_fingerprint(fingerprint),
        BackendSecurity::Insecure => build_client_config_insecure(),
    }
}

/// Client configuration validating against a CA file, or the bundled web PKI roots.
pub fn build_client_config_ca(ca_path: Option<&Path>) -> TlsResult<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    match ca_path {
        Some(path) => {
            for cert in parse_cert_pem(&read_pem(path)?)? {
                root_store
                    .add(cert)
                    .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Client configuration pinning the backend leaf certificate's SHA-256 fingerprint.
pub fn build_client_config_fingerprint(fingerprint: &[u8; 32]) -> TlsResult<ClientConfig> {
    Ok(ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(FingerprintVerifier::new(*fingerprint)))
        .with_no_client_auth())
}

/// Client configuration with no certificate verification (insecure, for development).
pub fn build_client_config_insecure() -> TlsResult<ClientConfig> {
    tracing::warn!(
        "backend TLS certificate verification is disabled; use only for development"
    );
    Ok(ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth())
}

/// Custom certificate verifier that checks the certificate's SHA-256 fingerprint.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: [u8; 32],
}

impl FingerprintVerifier {
    fn new(expected: [u8; 32]) -> Self {
        Self { expected }
    }
}

impl rustls::client::danger::ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let hash = sha256(end_entity.as_ref());

        if hash == self.expected {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: expected {}, got {}",
                format_fingerprint(&self.expected),
                format_fingerprint(&hash)
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Accepts any server certificate. Signatures are still checked.
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
