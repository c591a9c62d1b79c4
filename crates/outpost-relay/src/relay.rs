//! Relay startup and shutdown

use outpost_control::{ControlConfig, ControlPlane, SessionRegistry, TcpPortBinder};
use outpost_metrics::Metrics;
use outpost_router::{PortAllocator, TunnelRegistry};
use outpost_server_http::HttpServer;
use outpost_server_https::HttpsServer;
use outpost_server_tcp::TcpProxyCoordinator;
use outpost_transport::build_tls_acceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::RelayConfig;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] outpost_transport::TransportError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// A configured relay, ready to start
pub struct Relay {
    config: RelayConfig,
    metrics: Arc<dyn Metrics>,
}

/// A running relay
pub struct RelayHandle {
    /// Actual control listener address (resolved when port 0 was asked)
    pub tunnel_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
    registry: Arc<TunnelRegistry>,
    sessions: Arc<SessionRegistry>,
    tasks: JoinSet<()>,
    drain_window: Duration,
}

impl Relay {
    pub fn new(config: RelayConfig, metrics: Arc<dyn Metrics>) -> Self {
        Self { config, metrics }
    }

    /// Bind every listener and spawn the serving tasks
    pub async fn start(self) -> Result<RelayHandle, RelayError> {
        // rustls needs a process-level crypto provider before any acceptor
        let _ = rustls::crypto::ring::default_provider().install_default();

        let config = self.config;
        let metrics = self.metrics;

        let tls = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => Some(build_tls_acceptor(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(RelayError::Config(
                    "tls-cert and tls-key must be provided together".to_string(),
                ))
            }
        };

        let registry = Arc::new(TunnelRegistry::new());
        let sessions = Arc::new(SessionRegistry::new());
        let allocator = Arc::new(PortAllocator::new(
            config.port_range_start,
            config.port_range_end,
        ));
        let coordinator = TcpProxyCoordinator::new(
            registry.clone(),
            metrics.clone(),
            config.tunnel_addr.ip(),
            config.rendezvous_timeout,
        );

        let mut tasks = JoinSet::new();

        // Control listener
        let control_listener = TcpListener::bind(config.tunnel_addr).await?;
        let tunnel_addr = control_listener.local_addr()?;
        let plane = ControlPlane::new(
            registry.clone(),
            sessions.clone(),
            metrics.clone(),
            allocator,
            coordinator as Arc<dyn TcpPortBinder>,
            ControlConfig {
                domain: config.domain.clone(),
                auth_token: config.auth_token.clone(),
                handshake_timeout: config.handshake_timeout,
                rendezvous_timeout: config.rendezvous_timeout,
                ping_interval: config.ping_interval,
                ..ControlConfig::default()
            },
        );
        let control_tls = tls.clone();
        tasks.spawn(async move {
            if let Err(e) = plane.run(control_listener, control_tls).await {
                error!("control listener failed: {}", e);
            }
        });

        // Public HTTP listener
        let http_addr = match config.http_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let actual = listener.local_addr()?;
                let server = HttpServer::new(
                    registry.clone(),
                    metrics.clone(),
                    config.rendezvous_timeout,
                );
                tasks.spawn(async move {
                    if let Err(e) = server.run(listener).await {
                        error!("http listener failed: {}", e);
                    }
                });
                Some(actual)
            }
            None => None,
        };

        // Public HTTPS listener, only with a certificate to terminate with
        let https_addr = match (config.https_addr, tls) {
            (Some(addr), Some(acceptor)) => {
                let listener = TcpListener::bind(addr).await?;
                let actual = listener.local_addr()?;
                let server = HttpsServer::new(
                    registry.clone(),
                    metrics.clone(),
                    acceptor,
                    config.rendezvous_timeout,
                );
                tasks.spawn(async move {
                    if let Err(e) = server.run(listener).await {
                        error!("https listener failed: {}", e);
                    }
                });
                Some(actual)
            }
            (Some(_), None) => {
                warn!("https listener disabled: no TLS certificate configured");
                None
            }
            _ => None,
        };

        info!(
            domain = %config.domain,
            %tunnel_addr,
            "relay up"
        );

        Ok(RelayHandle {
            tunnel_addr,
            http_addr,
            https_addr,
            registry,
            sessions,
            tasks,
            drain_window: config.drain_window,
        })
    }

    /// Start, then run until SIGINT or SIGTERM
    pub async fn run(self) -> Result<(), RelayError> {
        let handle = self.start().await?;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        handle.shutdown().await;
        Ok(())
    }
}

impl RelayHandle {
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn tunnel_count(&self) -> usize {
        self.registry.len()
    }

    /// Close every session, wait out the drain window, stop the listeners
    pub async fn shutdown(mut self) {
        info!("shutting down relay");

        self.sessions.shutdown_all();
        let deadline = Instant::now() + self.drain_window;
        while !self.sessions.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if !self.sessions.is_empty() {
            warn!(
                "drain window elapsed with {} sessions still open",
                self.sessions.len()
            );
        }

        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        info!("relay stopped");
    }
}
