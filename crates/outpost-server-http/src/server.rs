//! HTTP listener and the shared tunnel-serving path

use chrono::Utc;
use outpost_http_auth::BasicAuth;
use outpost_metrics::Metrics;
use outpost_router::{Endpoint, ProxyError, TunnelInfo, TunnelRegistry};
use outpost_transport::{splice, IoStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::head::{read_request_head, HeadError, RequestHead};

/// HTTP listener errors
#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Public HTTP listener
pub struct HttpServer {
    registry: Arc<TunnelRegistry>,
    metrics: Arc<dyn Metrics>,
    rendezvous_timeout: Duration,
}

impl HttpServer {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        metrics: Arc<dyn Metrics>,
        rendezvous_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            rendezvous_timeout,
        }
    }

    /// Accept public streams until the listener dies
    pub async fn run(&self, listener: TcpListener) -> Result<(), HttpServerError> {
        info!("http listener on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let registry = self.registry.clone();
                    let metrics = self.metrics.clone();
                    let window = self.rendezvous_timeout;
                    tokio::spawn(async move {
                        handle_connection(socket, peer_addr, registry, metrics, window).await;
                    });
                }
                Err(e) => {
                    error!("http accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    mut socket: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<TunnelRegistry>,
    metrics: Arc<dyn Metrics>,
    window: Duration,
) {
    let head = match read_request_head(&mut socket).await {
        Ok(head) => head,
        Err(HeadError::TooLarge) => {
            respond_status(&mut socket, 431, "Request Header Fields Too Large", "").await;
            return;
        }
        Err(e) => {
            debug!("failed to read request head from {}: {}", peer_addr, e);
            return;
        }
    };

    let Some(host) = head.host.clone() else {
        respond_status(&mut socket, 400, "Bad Request", "missing Host header\n").await;
        return;
    };

    let tunnel = match registry.lookup(&Endpoint::Http(host.clone())) {
        Ok(tunnel) => tunnel,
        Err(_) => {
            debug!("no tunnel for http host {}", host);
            respond_status(
                &mut socket,
                404,
                "Not Found",
                &format!("Tunnel {} not found\n", host),
            )
            .await;
            return;
        }
    };

    serve_tunnel(socket, peer_addr, tunnel, head, metrics, window).await;
}

/// Gate, broker and splice one public stream into its tunnel.
///
/// Shared by the HTTP listener and, after TLS termination, the HTTPS
/// listener. `head.raw` is replayed as the first write to the proxy channel.
pub async fn serve_tunnel<S: IoStream>(
    mut public: S,
    peer_addr: SocketAddr,
    tunnel: TunnelInfo,
    head: RequestHead,
    metrics: Arc<dyn Metrics>,
    window: Duration,
) {
    // Basic auth is enforced here; the client is never engaged on a miss
    if !tunnel.http_auth.is_empty() {
        let realm = head.host.clone().unwrap_or_else(|| "outpost".to_string());
        let auth = BasicAuth::with_realm(tunnel.http_auth.clone(), realm);
        if !auth.check(head.authorization.as_deref()) {
            debug!(url = %tunnel.url, "rejecting public request: basic auth failed");
            let _ = public.write_all(&auth.unauthorized_response()).await;
            return;
        }
    }

    let mut backend = match tunnel.request_proxy(peer_addr, window).await {
        Ok(backend) => backend,
        Err(ProxyError::RendezvousTimeout(_)) => {
            warn!(url = %tunnel.url, "client did not dial back in time");
            respond_status(
                &mut public,
                504,
                "Gateway Timeout",
                "tunnel client did not respond\n",
            )
            .await;
            return;
        }
        Err(ProxyError::SessionClosed) => {
            respond_status(&mut public, 502, "Bad Gateway", "no backend available\n").await;
            return;
        }
    };

    let started = Utc::now();
    metrics.open_connection(&tunnel);

    if backend.write_all(&head.raw).await.is_err() {
        respond_status(&mut public, 502, "Bad Gateway", "tunnel write failed\n").await;
        metrics.close_connection(&tunnel, started, 0, 0);
        return;
    }

    let (spliced_in, bytes_out) = splice(public, backend).await;
    let bytes_in = head.raw.len() as u64 + spliced_in;

    debug!(
        url = %tunnel.url,
        bytes_in,
        bytes_out,
        "public connection finished"
    );
    metrics.close_connection(&tunnel, started, bytes_in, bytes_out);
}

/// Write a plain status response to the public caller
pub async fn respond_status<S>(stream: &mut S, status: u16, reason: &str, body: &str)
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
