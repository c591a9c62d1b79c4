//! outpost - reverse-tunnel relay server
//!
//! Accepts public HTTP/HTTPS/TCP traffic on behalf of clients behind NAT
//! and multiplexes it back to them over a single control connection.

use anyhow::{Context, Result};
use clap::Parser;
use outpost_relay::{Relay, RelayConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Outpost - expose local services behind NAT on public endpoints
#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Reverse-tunnel relay server")]
#[command(version)]
struct Args {
    /// Public base domain for tunnel subdomains (e.g. tunnels.example.com)
    #[arg(long, env = "OUTPOST_DOMAIN", default_value = "localhost")]
    domain: String,

    /// Public HTTP listener address
    #[arg(long, env = "OUTPOST_HTTP_ADDR", default_value = "0.0.0.0:80")]
    http_addr: SocketAddr,

    /// Public HTTPS listener address (requires --tls-cert/--tls-key)
    #[arg(long, env = "OUTPOST_HTTPS_ADDR", default_value = "0.0.0.0:443")]
    https_addr: SocketAddr,

    /// Control listener address for tunnel clients
    #[arg(long, env = "OUTPOST_TUNNEL_ADDR", default_value = "0.0.0.0:4443")]
    tunnel_addr: SocketAddr,

    /// PEM certificate chain for the control and HTTPS listeners
    #[arg(long, env = "OUTPOST_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for the control and HTTPS listeners
    #[arg(long, env = "OUTPOST_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Port range for dynamically allocated tcp tunnels, as start-end
    #[arg(long, env = "OUTPOST_PORT_RANGE", default_value = "10000-12000", value_parser = parse_port_range)]
    port_range: (u16, u16),

    /// Shared secret clients must present; unset accepts any client
    #[arg(long, env = "OUTPOST_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Interval between local metrics snapshots, in seconds
    #[arg(long, env = "OUTPOST_REPORT_INTERVAL", default_value = "30")]
    report_interval: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_port_range(raw: &str) -> Result<(u16, u16), String> {
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| format!("expected start-end, got {:?}", raw))?;
    let start: u16 = start
        .trim()
        .parse()
        .map_err(|e| format!("bad start port: {}", e))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|e| format!("bad end port: {}", e))?;
    if start > end {
        return Err(format!("empty port range {}-{}", start, end));
    }
    Ok((start, end))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!("outpost {} starting", env!("CARGO_PKG_VERSION"));

    // KEEN_API_KEY + KEEN_PROJECT_TOKEN select the upstream reporter
    let metrics = outpost_metrics::from_env(
        Duration::from_secs(args.report_interval),
        Duration::from_secs(60),
    );

    let config = RelayConfig {
        domain: args.domain,
        http_addr: Some(args.http_addr),
        https_addr: Some(args.https_addr),
        tunnel_addr: args.tunnel_addr,
        tls_cert: args.tls_cert,
        tls_key: args.tls_key,
        port_range_start: args.port_range.0,
        port_range_end: args.port_range.1,
        auth_token: args.auth_token,
        ..RelayConfig::default()
    };

    Relay::new(config, metrics)
        .run()
        .await
        .context("relay failed")
}
