//! Endpoint registry
//!
//! Authoritative for uniqueness: a public URL can belong to at most one
//! tunnel at a time, and unregistration happens before the owning session
//! releases its storage, so a later registration of the same URL can only
//! succeed after the old tunnel is fully gone.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use outpost_proto::Protocol;
use outpost_transport::ProxyStream;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Fingerprint key a public listener resolves against the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Http(String),
    Https(String),
    Tcp(u16),
    Udp(u16),
}

impl Endpoint {
    pub fn scheme(&self) -> &'static str {
        match self {
            Endpoint::Http(_) => "http",
            Endpoint::Https(_) => "https",
            Endpoint::Tcp(_) => "tcp",
            Endpoint::Udp(_) => "udp",
        }
    }
}

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("endpoint already in use: {0:?}")]
    EndpointInUse(Endpoint),

    #[error("no tunnel registered for {0:?}")]
    NotFound(Endpoint),
}

/// Proxy brokering errors, as seen by a public listener
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("control session is gone")]
    SessionClosed,

    #[error("client did not dial back within {0:?}")]
    RendezvousTimeout(Duration),
}

/// A listener's request for one proxy channel, served by the owning session
pub struct ProxyRequest {
    pub url: String,
    pub client_addr: String,
    pub reply: oneshot::Sender<ProxyStream>,
}

/// Lookup view of one tunnel
///
/// Cheap to clone; the control session owns the tunnel itself. `proxy_tx`
/// reaches the owning session's broker.
#[derive(Clone)]
pub struct TunnelInfo {
    pub id: String,
    pub client_id: String,
    pub protocol: Protocol,
    pub url: String,
    /// `user:password` for HTTP Basic auth; empty when the tunnel is open
    pub http_auth: String,
    pub os: String,
    pub user: String,
    pub client_version: String,
    pub named_subdomain: bool,
    pub started_at: DateTime<Utc>,
    proxy_tx: mpsc::Sender<ProxyRequest>,
}

impl TunnelInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        client_id: String,
        protocol: Protocol,
        url: String,
        http_auth: String,
        os: String,
        user: String,
        client_version: String,
        named_subdomain: bool,
        proxy_tx: mpsc::Sender<ProxyRequest>,
    ) -> Self {
        Self {
            id,
            client_id,
            protocol,
            url,
            http_auth,
            os,
            user,
            client_version,
            named_subdomain,
            started_at: Utc::now(),
            proxy_tx,
        }
    }

    /// Ask the owning session for a proxy channel to this tunnel.
    ///
    /// Sends a rendezvous request and waits up to `window` for the client to
    /// dial back. The session keeps running whether or not the wait times
    /// out; expiry only cancels this one ticket.
    pub async fn request_proxy(
        &self,
        client_addr: SocketAddr,
        window: Duration,
    ) -> Result<ProxyStream, ProxyError> {
        let (tx, rx) = oneshot::channel();
        self.proxy_tx
            .send(ProxyRequest {
                url: self.url.clone(),
                client_addr: client_addr.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| ProxyError::SessionClosed)?;

        match tokio::time::timeout(window, rx).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(_)) => Err(ProxyError::SessionClosed),
            Err(_) => Err(ProxyError::RendezvousTimeout(window)),
        }
    }
}

/// Process-wide endpoint index
///
/// Safe under concurrent access from all public listeners and all control
/// sessions; register/unregister rates are low.
pub struct TunnelRegistry {
    endpoints: DashMap<Endpoint, TunnelInfo>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
        }
    }

    /// Register a tunnel under `endpoint`. Fails when the endpoint is taken.
    pub fn register(&self, endpoint: Endpoint, tunnel: TunnelInfo) -> Result<(), RegistryError> {
        match self.endpoints.entry(endpoint.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!("rejecting registration, endpoint in use: {:?}", endpoint);
                Err(RegistryError::EndpointInUse(endpoint))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                trace!("registered {} at {:?}", tunnel.id, endpoint);
                slot.insert(tunnel);
                Ok(())
            }
        }
    }

    /// Resolve a fingerprint to its tunnel
    pub fn lookup(&self, endpoint: &Endpoint) -> Result<TunnelInfo, RegistryError> {
        self.endpoints
            .get(endpoint)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(endpoint.clone()))
    }

    /// Remove an endpoint. Idempotent: removing an absent endpoint is a no-op.
    pub fn unregister(&self, endpoint: &Endpoint) {
        if self.endpoints.remove(endpoint).is_some() {
            trace!("unregistered {:?}", endpoint);
        }
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.contains_key(endpoint)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Snapshot of all live public URLs
    pub fn urls(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|entry| entry.value().url.clone())
            .collect()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
