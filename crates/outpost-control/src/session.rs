//! One control session per connected client
//!
//! State machine: Accepted (handshake running, owned by the control plane)
//! -> Authenticated (this type) -> Closing -> Closed. The session runs a
//! reader loop that dispatches inbound messages and a writer task that
//! serializes everything outbound, so messages reach the client in the
//! order they were enqueued. Bind requests are handled inline in the reader
//! loop, which makes URL assignment serial per session by construction.

use outpost_proto::{
    Auth, ControlMessage, NewTunnel, Ping, Pong, Protocol, ReqProxy, ReqTunnel, StartProxy,
};
use outpost_router::{canonical_host, random_subdomain, Endpoint, ProxyRequest, TunnelInfo};
use outpost_transport::{BoxedStream, FramedConnection, FramedReader, ProxyStream};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;
use tokio::io::ReadHalf;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pending::PendingProxies;
use crate::plane::ControlShared;

/// Why a session left the Authenticated state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean EOF from the client
    Eof,
    /// Transport or framing failure
    TransportError,
    /// The client sent a message that is invalid in this state
    ProtocolViolation,
    /// No pong within the heartbeat deadline
    HeartbeatExpired,
    /// Server shutdown or explicit close
    Shutdown,
}

struct OwnedTunnel {
    endpoint: Endpoint,
    info: TunnelInfo,
    /// Allocated raw-TCP port, released on teardown
    port: Option<u16>,
}

/// An authenticated control session
pub struct ControlSession {
    client_id: String,
    auth: Auth,
    outbound: mpsc::Sender<ControlMessage>,
    proxy_tx: mpsc::Sender<ProxyRequest>,
    pending: PendingProxies,
    tunnels: Mutex<Vec<OwnedTunnel>>,
    shutdown: Notify,
}

impl ControlSession {
    pub(crate) fn new(
        client_id: String,
        auth: Auth,
        outbound: mpsc::Sender<ControlMessage>,
        proxy_tx: mpsc::Sender<ProxyRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            auth,
            outbound,
            proxy_tx,
            pending: PendingProxies::new(),
            tunnels: Mutex::new(Vec::new()),
            shutdown: Notify::new(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().unwrap().len()
    }

    pub fn pending_tickets(&self) -> usize {
        self.pending.len()
    }

    /// Request the session close; teardown happens on its reader task
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Route a dialed-back proxy transport to the oldest pending ticket.
    ///
    /// Writes `StartProxy` on the transport and hands the raw stream to the
    /// waiting listener. With no live ticket the transport is dropped.
    pub async fn deliver_proxy(&self, mut framed: FramedConnection<BoxedStream>) {
        let Some(slot) = self.pending.claim() else {
            debug!(
                client_id = %self.client_id,
                "no pending ticket for dial-back, dropping proxy transport"
            );
            return;
        };

        let start = ControlMessage::StartProxy(StartProxy {
            url: slot.url,
            client_addr: slot.client_addr,
        });
        if framed.write_message(&start).await.is_err() {
            // The dial-back died before activation; the listener waiting on
            // this ticket observes the dropped reply as no-backend.
            debug!(client_id = %self.client_id, "proxy transport died before StartProxy");
            return;
        }

        let (stream, buffered) = framed.into_inner();
        let _ = slot.reply.send(ProxyStream::new(stream, buffered));
    }

    /// Reader loop. Returns after teardown is complete.
    pub(crate) async fn run(
        self: Arc<Self>,
        shared: Arc<ControlShared>,
        mut reader: FramedReader<ReadHalf<BoxedStream>>,
        mut proxy_rx: mpsc::Receiver<ProxyRequest>,
    ) {
        let ping_interval = shared.config.ping_interval;
        let heartbeat_deadline = ping_interval * 3;
        let mut ping = tokio::time::interval(ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_pong = Instant::now();

        let reason = loop {
            tokio::select! {
                inbound = reader.read_message() => match inbound {
                    Ok(Some(ControlMessage::ReqTunnel(req))) => {
                        let reply = self.handle_bind(&shared, req).await;
                        if self
                            .outbound
                            .send(ControlMessage::NewTunnel(reply))
                            .await
                            .is_err()
                        {
                            break CloseReason::TransportError;
                        }
                    }
                    Ok(Some(ControlMessage::Ping(_))) => {
                        last_pong = Instant::now();
                        if self
                            .outbound
                            .send(ControlMessage::Pong(Pong {}))
                            .await
                            .is_err()
                        {
                            break CloseReason::TransportError;
                        }
                    }
                    Ok(Some(ControlMessage::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Ok(Some(other)) => {
                        warn!(
                            client_id = %self.client_id,
                            message = other.type_name(),
                            "unexpected message on control session"
                        );
                        break CloseReason::ProtocolViolation;
                    }
                    Ok(None) => break CloseReason::Eof,
                    Err(e) => {
                        debug!(client_id = %self.client_id, "control transport failed: {}", e);
                        break CloseReason::TransportError;
                    }
                },

                Some(request) = proxy_rx.recv() => {
                    self.pending.park(request);
                    if self
                        .outbound
                        .send(ControlMessage::ReqProxy(ReqProxy {}))
                        .await
                        .is_err()
                    {
                        break CloseReason::TransportError;
                    }
                }

                _ = ping.tick() => {
                    if last_pong.elapsed() > heartbeat_deadline {
                        warn!(client_id = %self.client_id, "heartbeat deadline expired");
                        shared.metrics.lost_heartbeat();
                        break CloseReason::HeartbeatExpired;
                    }
                    if self
                        .outbound
                        .send(ControlMessage::Ping(Ping {}))
                        .await
                        .is_err()
                    {
                        break CloseReason::TransportError;
                    }
                    self.pending.prune(shared.config.rendezvous_timeout);
                }

                _ = self.shutdown.notified() => break CloseReason::Shutdown,
            }
        };

        self.teardown(&shared, reason);
    }

    /// Process one bind request and build the reply
    async fn handle_bind(&self, shared: &ControlShared, req: ReqTunnel) -> NewTunnel {
        match self.bind_tunnel(shared, &req).await {
            Ok(info) => {
                info!(
                    client_id = %self.client_id,
                    url = %info.url,
                    "tunnel established"
                );
                NewTunnel {
                    req_id: req.req_id,
                    url: info.url,
                    protocol: req.protocol,
                    error: String::new(),
                }
            }
            Err(error) => {
                info!(
                    client_id = %self.client_id,
                    protocol = %req.protocol,
                    %error,
                    "bind request rejected"
                );
                NewTunnel {
                    req_id: req.req_id,
                    url: String::new(),
                    protocol: req.protocol,
                    error,
                }
            }
        }
    }

    async fn bind_tunnel(
        &self,
        shared: &ControlShared,
        req: &ReqTunnel,
    ) -> Result<TunnelInfo, String> {
        let protocol: Protocol = req.protocol.parse().map_err(|_| {
            format!("unsupported tunnel protocol: {:?}", req.protocol)
        })?;

        match protocol {
            Protocol::Http | Protocol::Https => {
                let (hostname, named) = hostname_for_request(req, &shared.config.domain)?;
                let url = format!("{}://{}", protocol, hostname);
                let endpoint = match protocol {
                    Protocol::Http => Endpoint::Http(hostname),
                    _ => Endpoint::Https(hostname),
                };

                let tunnel = self.new_tunnel_info(protocol, url, req, named);
                shared
                    .registry
                    .register(endpoint.clone(), tunnel.clone())
                    .map_err(|_| format!("the hostname {} is already in use", tunnel.url))?;

                self.track(endpoint, tunnel.clone(), None);
                shared.metrics.open_tunnel(&tunnel);
                Ok(tunnel)
            }

            Protocol::Tcp => {
                let requested = (req.remote_port != 0).then_some(req.remote_port);
                let port = shared
                    .allocator
                    .allocate(requested)
                    .map_err(|e| e.to_string())?;

                let url = format!("tcp://{}:{}", shared.config.domain, port);
                let endpoint = Endpoint::Tcp(port);
                let tunnel = self.new_tunnel_info(protocol, url, req, false);

                if shared
                    .registry
                    .register(endpoint.clone(), tunnel.clone())
                    .is_err()
                {
                    shared.allocator.release(port);
                    return Err(format!("the port {} is already in use", port));
                }

                if let Err(e) = shared.binder.bind_port(port).await {
                    shared.registry.unregister(&endpoint);
                    shared.allocator.release(port);
                    return Err(format!("failed to open port {}: {}", port, e));
                }

                self.track(endpoint, tunnel.clone(), Some(port));
                shared.metrics.open_tunnel(&tunnel);
                Ok(tunnel)
            }

            Protocol::Udp => Err("udp tunnels are not supported by this server".to_string()),
        }
    }

    fn new_tunnel_info(
        &self,
        protocol: Protocol,
        url: String,
        req: &ReqTunnel,
        named_subdomain: bool,
    ) -> TunnelInfo {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(12);
        TunnelInfo::new(
            format!("tun-{}", id),
            self.client_id.clone(),
            protocol,
            url,
            req.http_auth.clone(),
            self.auth.os.clone(),
            self.auth.user.clone(),
            self.auth.mm_version.clone(),
            named_subdomain,
            self.proxy_tx.clone(),
        )
    }

    fn track(&self, endpoint: Endpoint, info: TunnelInfo, port: Option<u16>) {
        self.tunnels.lock().unwrap().push(OwnedTunnel {
            endpoint,
            info,
            port,
        });
    }

    /// Closing -> Closed: cancel tickets, then unregister every owned
    /// tunnel before the session disappears from the registry
    fn teardown(&self, shared: &ControlShared, reason: CloseReason) {
        self.pending.cancel_all();

        let owned: Vec<OwnedTunnel> = self.tunnels.lock().unwrap().drain(..).collect();
        for tunnel in owned {
            shared.registry.unregister(&tunnel.endpoint);
            if let Some(port) = tunnel.port {
                shared.binder.release_port(port);
                shared.allocator.release(port);
            }
            shared.metrics.close_tunnel(&tunnel.info);
            debug!(url = %tunnel.info.url, "tunnel closed");
        }

        shared.sessions.remove(&self.client_id);
        info!(client_id = %self.client_id, ?reason, "control session closed");
    }
}

/// Resolve the public hostname for an HTTP/HTTPS bind.
///
/// Precedence: client-supplied full hostname, then requested subdomain
/// under the base domain, then a random subdomain. Returns the hostname
/// and whether the client named it.
fn hostname_for_request(req: &ReqTunnel, domain: &str) -> Result<(String, bool), String> {
    let (hostname, named) = if !req.hostname.is_empty() {
        (canonical_host(&req.hostname), true)
    } else if !req.subdomain.is_empty() {
        let label = req.subdomain.trim().to_ascii_lowercase();
        (format!("{}.{}", label, domain), true)
    } else {
        (format!("{}.{}", random_subdomain(), domain), false)
    };

    if hostname.starts_with('.')
        || hostname.contains(|c: char| c.is_whitespace() || c == '/' || c == '@')
        || hostname.trim_matches('.').is_empty()
    {
        return Err(format!("malformed hostname in bind request: {:?}", hostname));
    }

    Ok((hostname, named))
}
