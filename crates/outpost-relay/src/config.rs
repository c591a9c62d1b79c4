//! Relay configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Everything a relay needs to come up
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Public base domain; subdomain tunnels live under it and tcp URLs
    /// name it
    pub domain: String,
    /// Public HTTP listener; `None` disables it
    pub http_addr: Option<SocketAddr>,
    /// Public HTTPS listener; requires a TLS certificate
    pub https_addr: Option<SocketAddr>,
    /// Control listener for tunnel clients
    pub tunnel_addr: SocketAddr,
    /// PEM certificate chain for the control and HTTPS listeners
    pub tls_cert: Option<PathBuf>,
    /// PEM private key
    pub tls_key: Option<PathBuf>,
    /// Inclusive range for dynamically allocated tcp tunnel ports
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Shared secret clients must present; `None` accepts anyone
    pub auth_token: Option<String>,

    pub handshake_timeout: Duration,
    pub rendezvous_timeout: Duration,
    pub ping_interval: Duration,
    /// How long shutdown waits for sessions and splices to wind down
    pub drain_window: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            http_addr: Some("0.0.0.0:80".parse().unwrap()),
            https_addr: Some("0.0.0.0:443".parse().unwrap()),
            tunnel_addr: "0.0.0.0:4443".parse().unwrap(),
            tls_cert: None,
            tls_key: None,
            port_range_start: 10000,
            port_range_end: 12000,
            auth_token: None,
            handshake_timeout: Duration::from_secs(10),
            rendezvous_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
            drain_window: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.domain, "localhost");
        assert!(config.port_range_start < config.port_range_end);
        assert!(config.tls_cert.is_none());
    }
}
