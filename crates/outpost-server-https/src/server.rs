//! HTTPS listener implementation

use bytes::BytesMut;
use outpost_metrics::Metrics;
use outpost_router::{canonical_host, extract_sni, Endpoint, TunnelRegistry};
use outpost_server_http::{read_request_head, respond_status, serve_tunnel};
use outpost_transport::ProxyStream;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Cap on ClientHello bytes buffered before TLS takes over
const MAX_CLIENT_HELLO: usize = 64 * 1024;

const TLS_RECORD_HEADER: usize = 5;
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// HTTPS listener errors
#[derive(Debug, Error)]
pub enum HttpsServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Public HTTPS listener
pub struct HttpsServer {
    registry: Arc<TunnelRegistry>,
    metrics: Arc<dyn Metrics>,
    acceptor: TlsAcceptor,
    rendezvous_timeout: Duration,
}

impl HttpsServer {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        metrics: Arc<dyn Metrics>,
        acceptor: TlsAcceptor,
        rendezvous_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            acceptor,
            rendezvous_timeout,
        }
    }

    /// Accept public TLS streams until the listener dies
    pub async fn run(&self, listener: TcpListener) -> Result<(), HttpsServerError> {
        info!("https listener on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let registry = self.registry.clone();
                    let metrics = self.metrics.clone();
                    let acceptor = self.acceptor.clone();
                    let window = self.rendezvous_timeout;
                    tokio::spawn(async move {
                        handle_connection(socket, peer_addr, registry, metrics, acceptor, window)
                            .await;
                    });
                }
                Err(e) => {
                    error!("https accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<TunnelRegistry>,
    metrics: Arc<dyn Metrics>,
    acceptor: TlsAcceptor,
    window: Duration,
) {
    // Route on the raw ClientHello first; no SNI means no session is ever
    // engaged for this connection
    let hello = match read_client_hello(&mut socket).await {
        Ok(hello) => hello,
        Err(e) => {
            debug!("unusable TLS client hello from {}: {}", peer_addr, e);
            return;
        }
    };

    let sni = match extract_sni(&hello) {
        Ok(name) => canonical_host(&name),
        Err(e) => {
            debug!("rejecting https connection from {}: {}", peer_addr, e);
            return;
        }
    };

    let lookup = registry.lookup(&Endpoint::Https(sni.clone()));

    // The hello bytes were consumed for routing; replay them into the
    // handshake
    let replay = ProxyStream::new(Box::new(socket), hello);
    let mut tls_stream = match acceptor.accept(replay).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("TLS handshake failed from {}: {}", peer_addr, e);
            return;
        }
    };

    let tunnel = match lookup {
        Ok(tunnel) => tunnel,
        Err(_) => {
            debug!("no tunnel for https host {}", sni);
            respond_status(
                &mut tls_stream,
                404,
                "Not Found",
                &format!("Tunnel {} not found\n", sni),
            )
            .await;
            return;
        }
    };

    let head = match read_request_head(&mut tls_stream).await {
        Ok(head) => head,
        Err(e) => {
            debug!("failed to read https request head from {}: {}", peer_addr, e);
            return;
        }
    };

    serve_tunnel(tls_stream, peer_addr, tunnel, head, metrics, window).await;
}

/// Read exactly one TLS record off the socket (the ClientHello)
async fn read_client_hello(socket: &mut TcpStream) -> std::io::Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(2 * 1024);

    loop {
        if buf.len() >= TLS_RECORD_HEADER {
            if buf[0] != RECORD_TYPE_HANDSHAKE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "not a TLS handshake",
                ));
            }
            let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
            if TLS_RECORD_HEADER + record_len > MAX_CLIENT_HELLO {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "oversized client hello",
                ));
            }
            if buf.len() >= TLS_RECORD_HEADER + record_len {
                return Ok(buf);
            }
        }

        let n = socket.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
    }
}
