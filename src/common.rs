//! Helpers shared by the dialer, pumps and server.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Read buffer size for raw relaying.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

type TokioResolver =
    hickory_resolver::Resolver<hickory_resolver::name_server::TokioConnectionProvider>;

/// Parses a connect address string into a SocketAddr and extracts the host for SNI.
///
/// Uses a shared DNS resolver for efficiency when making multiple resolutions.
pub async fn parse_connect_address(
    connect: &str,
    sni: Option<&str>,
    resolver: &DnsResolver,
) -> Result<(SocketAddr, String)> {
    let Some(colon_pos) = connect.rfind(':') else {
        return Err(Error::Config(format!(
            "address must include port: '{}'",
            connect
        )));
    };

    let host_part = &connect[..colon_pos];
    let port_part = &connect[colon_pos + 1..];

    // Handle IPv6 addresses in brackets
    let host = host_part
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host_part);
    if host.is_empty() {
        return Err(Error::Config(format!(
            "address must include host: '{}'",
            connect
        )));
    }

    let port: u16 = port_part
        .parse()
        .map_err(|_| Error::Config(format!("invalid port in address '{}'", connect)))?;

    let addr = resolver.resolve(host, port).await?;

    let sni_host = sni.map(str::to_string).unwrap_or_else(|| host.to_string());

    Ok((addr, sni_host))
}

/// Shared DNS resolver, built on first use and reused for every dial.
pub struct DnsResolver {
    resolver: Arc<Mutex<Option<TokioResolver>>>,
}

impl DnsResolver {
    /// Creates a new DNS resolver.
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolves a hostname to a SocketAddr asynchronously using hickory-resolver.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let mut resolver_guard = self.resolver.lock().await;
        if resolver_guard.is_none() {
            let resolver = hickory_resolver::Resolver::builder_tokio()
                .map_err(|e| Error::Config(format!("failed to create DNS resolver: {}", e)))?
                .build();
            *resolver_guard = Some(resolver);
        }
        let Some(resolver) = resolver_guard.as_ref() else {
            return Err(Error::Config("DNS resolver unavailable".to_string()));
        };

        let response = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::Config(format!("failed to resolve '{}': {}", host, e)))?;

        response
            .iter()
            .next()
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or_else(|| Error::Config(format!("no addresses found for '{}'", host)))
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats a duration in a compact human-readable form (e.g. `1h30m10s`, `500ms`).
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let nanos = d.subsec_nanos();

    if secs == 0 && nanos == 0 {
        return "0s".to_string();
    }

    let mut result = String::new();

    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs_remainder = secs % 60;

    if hours > 0 {
        result.push_str(&format!("{}h", hours));
    }
    if mins > 0 {
        result.push_str(&format!("{}m", mins));
    }
    if secs_remainder > 0 {
        result.push_str(&format!("{}s", secs_remainder));
    } else if hours == 0 && mins == 0 {
        let ms = nanos / 1_000_000;
        if ms > 0 {
            result.push_str(&format!("{}ms", ms));
        }
    }

    if result.is_empty() {
        "0s".to_string()
    } else {
        result
    }
}
