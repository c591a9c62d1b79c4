//! Relay composition
//!
//! Builds the shared infrastructure (tunnel registry, session registry,
//! metrics), brings up the control listener and the public listeners, and
//! owns graceful shutdown: sessions are closed first, in-flight work gets a
//! small drain window, then the listeners stop.

pub mod config;
pub mod relay;

pub use config::RelayConfig;
pub use relay::{Relay, RelayError, RelayHandle};
