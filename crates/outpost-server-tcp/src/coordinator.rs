//! Per-port listener coordinator

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use outpost_control::TcpPortBinder;
use outpost_metrics::Metrics;
use outpost_router::{Endpoint, TunnelRegistry};
use outpost_transport::splice;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Spawns and reaps one accept task per tcp tunnel port
pub struct TcpProxyCoordinator {
    registry: Arc<TunnelRegistry>,
    metrics: Arc<dyn Metrics>,
    bind_ip: IpAddr,
    rendezvous_timeout: Duration,
    listeners: DashMap<u16, JoinHandle<()>>,
}

impl TcpProxyCoordinator {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        metrics: Arc<dyn Metrics>,
        bind_ip: IpAddr,
        rendezvous_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            metrics,
            bind_ip,
            rendezvous_timeout,
            listeners: DashMap::new(),
        })
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    async fn accept_loop(
        listener: TcpListener,
        port: u16,
        registry: Arc<TunnelRegistry>,
        metrics: Arc<dyn Metrics>,
        window: Duration,
    ) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let registry = registry.clone();
                    let metrics = metrics.clone();
                    tokio::spawn(async move {
                        serve_stream(socket, peer_addr, port, registry, metrics, window).await;
                    });
                }
                Err(e) => {
                    error!("tcp accept error on port {}: {}", port, e);
                }
            }
        }
    }
}

async fn serve_stream(
    socket: TcpStream,
    peer_addr: SocketAddr,
    port: u16,
    registry: Arc<TunnelRegistry>,
    metrics: Arc<dyn Metrics>,
    window: Duration,
) {
    // A miss means the tunnel died between unbind and reap; just hang up
    let Ok(tunnel) = registry.lookup(&Endpoint::Tcp(port)) else {
        debug!("no tunnel for tcp port {}, closing", port);
        return;
    };

    let backend = match tunnel.request_proxy(peer_addr, window).await {
        Ok(backend) => backend,
        Err(e) => {
            debug!(url = %tunnel.url, "tcp proxy unavailable: {}", e);
            return;
        }
    };

    let started = Utc::now();
    metrics.open_connection(&tunnel);

    let (bytes_in, bytes_out) = splice(socket, backend).await;

    debug!(url = %tunnel.url, bytes_in, bytes_out, "tcp connection finished");
    metrics.close_connection(&tunnel, started, bytes_in, bytes_out);
}

#[async_trait]
impl TcpPortBinder for TcpProxyCoordinator {
    async fn bind_port(&self, port: u16) -> Result<(), String> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| format!("bind {}: {}", addr, e))?;

        info!("tcp tunnel listener on {}", addr);

        let task = tokio::spawn(Self::accept_loop(
            listener,
            port,
            self.registry.clone(),
            self.metrics.clone(),
            self.rendezvous_timeout,
        ));

        if let Some(previous) = self.listeners.insert(port, task) {
            // A stale listener for this port should be impossible while the
            // allocator tracks it, but never leave one running
            previous.abort();
        }
        Ok(())
    }

    fn release_port(&self, port: u16) {
        if let Some((_, task)) = self.listeners.remove(&port) {
            task.abort();
            debug!("tcp tunnel listener on port {} reaped", port);
        }
    }
}
