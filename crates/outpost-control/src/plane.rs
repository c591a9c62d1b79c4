//! Control listener
//!
//! Accepts framed transports on the tunnel port (TLS-terminated when a
//! certificate is configured) and classifies each by its first message:
//! `Auth` starts a session, `RegProxy` is a dial-back routed to its owning
//! session. Anything else, or silence past the handshake window, drops the
//! transport.

use outpost_metrics::Metrics;
use outpost_proto::{Auth, AuthResp, ControlMessage, RegProxy};
use outpost_router::{PortAllocator, TunnelRegistry};
use outpost_transport::{BoxedStream, FramedConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::session::ControlSession;
use crate::sessions::SessionRegistry;
use crate::TcpPortBinder;

/// Capacity of the per-session outbound queue
const OUTBOUND_QUEUE: usize = 64;
/// Capacity of the per-session proxy request queue
const PROXY_QUEUE: usize = 32;

/// Control plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunable control plane behavior
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Public base domain for subdomain tunnels and tcp URLs
    pub domain: String,
    /// Shared secret; `None` accepts any client
    pub auth_token: Option<String>,
    /// Window for the first message on a fresh transport
    pub handshake_timeout: Duration,
    /// Window a parked ticket stays claimable
    pub rendezvous_timeout: Duration,
    /// Server ping cadence; the deadline is three intervals
    pub ping_interval: Duration,
    /// Protocol version echoed in AuthResp
    pub version: String,
    /// Server release echoed in AuthResp
    pub mm_version: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            auth_token: None,
            handshake_timeout: Duration::from_secs(10),
            rendezvous_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
            version: "2".to_string(),
            mm_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Dependencies shared by every session
pub(crate) struct ControlShared {
    pub registry: Arc<TunnelRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Arc<dyn Metrics>,
    pub allocator: Arc<PortAllocator>,
    pub binder: Arc<dyn TcpPortBinder>,
    pub config: ControlConfig,
}

/// The control listener
pub struct ControlPlane {
    shared: Arc<ControlShared>,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        sessions: Arc<SessionRegistry>,
        metrics: Arc<dyn Metrics>,
        allocator: Arc<PortAllocator>,
        binder: Arc<dyn TcpPortBinder>,
        config: ControlConfig,
    ) -> Self {
        Self {
            shared: Arc::new(ControlShared {
                registry,
                sessions,
                metrics,
                allocator,
                binder,
                config,
            }),
        }
    }

    /// Accept control transports until the listener dies
    pub async fn run(
        &self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> Result<(), ControlError> {
        info!(
            "control listener on {} ({})",
            listener.local_addr()?,
            if tls.is_some() { "tls" } else { "plaintext" }
        );

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let shared = self.shared.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        handle_transport(shared, socket, peer_addr, tls).await;
                    });
                }
                Err(e) => {
                    error!("control accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_transport(
    shared: Arc<ControlShared>,
    socket: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
) {
    let stream: BoxedStream = match tls {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(tls_stream) => Box::new(tls_stream),
            Err(e) => {
                debug!("TLS handshake failed from {}: {}", peer_addr, e);
                return;
            }
        },
        None => Box::new(socket),
    };

    let mut framed = FramedConnection::new(stream);

    let first = tokio::time::timeout(shared.config.handshake_timeout, framed.read_message()).await;
    match first {
        Err(_) => {
            debug!("handshake timed out from {}", peer_addr);
        }
        Ok(Err(e)) => {
            debug!("handshake failed from {}: {}", peer_addr, e);
        }
        Ok(Ok(None)) => {}
        Ok(Ok(Some(ControlMessage::Auth(auth)))) => {
            start_session(shared, framed, auth, peer_addr).await;
        }
        Ok(Ok(Some(ControlMessage::RegProxy(reg)))) => {
            route_proxy(shared, framed, reg).await;
        }
        Ok(Ok(Some(other))) => {
            warn!(
                "expected Auth or RegProxy from {}, got {}",
                peer_addr,
                other.type_name()
            );
        }
    }
}

/// Accepted -> Authenticated (or Closed on bad auth)
async fn start_session(
    shared: Arc<ControlShared>,
    mut framed: FramedConnection<BoxedStream>,
    auth: Auth,
    peer_addr: SocketAddr,
) {
    let config = &shared.config;

    if let Some(expected) = &config.auth_token {
        if auth.password != *expected {
            warn!(user = %auth.user, "rejecting client from {}: bad credentials", peer_addr);
            let reply = ControlMessage::AuthResp(AuthResp {
                version: config.version.clone(),
                mm_version: config.mm_version.clone(),
                client_id: String::new(),
                error: "authentication failed: invalid credentials".to_string(),
            });
            let _ = framed.write_message(&reply).await;
            return;
        }
    }

    // The client never picks its own identity
    let client_id = Uuid::new_v4().to_string();

    let reply = ControlMessage::AuthResp(AuthResp {
        version: config.version.clone(),
        mm_version: config.mm_version.clone(),
        client_id: client_id.clone(),
        error: String::new(),
    });
    if let Err(e) = framed.write_message(&reply).await {
        debug!("failed to send AuthResp to {}: {}", peer_addr, e);
        return;
    }

    info!(
        %client_id,
        user = %auth.user,
        os = %auth.os,
        version = %auth.mm_version,
        "client authenticated from {}",
        peer_addr
    );

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControlMessage>(OUTBOUND_QUEUE);
    let (proxy_tx, proxy_rx) = mpsc::channel(PROXY_QUEUE);

    let session = ControlSession::new(client_id, auth, outbound_tx, proxy_tx);
    shared.sessions.insert(session.clone());

    let (reader, mut writer) = framed.into_split();

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if writer.write_message(&msg).await.is_err() {
                break;
            }
        }
        writer.shutdown().await;
    });

    session.run(shared, reader, proxy_rx).await;
    writer_task.abort();
}

/// Route a dialed-back proxy transport to its owning session
async fn route_proxy(
    shared: Arc<ControlShared>,
    framed: FramedConnection<BoxedStream>,
    reg: RegProxy,
) {
    match shared.sessions.get(&reg.client_id) {
        Some(session) => session.deliver_proxy(framed).await,
        None => {
            debug!(
                client_id = %reg.client_id,
                "dial-back for unknown session, dropping transport"
            );
        }
    }
}
