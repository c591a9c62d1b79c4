//! Control plane: one session per connected tunnel client
//!
//! The control listener accepts framed transports. A transport that opens
//! with `Auth` becomes a control session; one that opens with `RegProxy` is
//! a dialed-back proxy channel and is routed to its owning session's oldest
//! pending rendezvous ticket.

pub mod pending;
pub mod plane;
pub mod session;
pub mod sessions;

pub use pending::PendingProxies;
pub use plane::{ControlConfig, ControlError, ControlPlane};
pub use session::{CloseReason, ControlSession};
pub use sessions::SessionRegistry;

use async_trait::async_trait;

/// Spawns and reaps the per-port public listeners that raw TCP tunnels need.
///
/// Implemented by the TCP listener coordinator; injected here so binds can
/// bring a port up before the `NewTunnel` reply goes out.
#[async_trait]
pub trait TcpPortBinder: Send + Sync {
    /// Bind a public listener on `port`. The error string is surfaced to
    /// the client in the `NewTunnel` reply.
    async fn bind_port(&self, port: u16) -> Result<(), String>;

    /// Tear down the listener for `port`. Idempotent.
    fn release_port(&self, port: u16);
}

/// A binder for deployments with no TCP tunnel support (and for tests)
pub struct NoTcpBinder;

#[async_trait]
impl TcpPortBinder for NoTcpBinder {
    async fn bind_port(&self, _port: u16) -> Result<(), String> {
        Err("tcp tunnels are not enabled on this server".to_string())
    }

    fn release_port(&self, _port: u16) {}
}
