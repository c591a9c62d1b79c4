//! Tunnel registry and public-request routing
//!
//! The registry is the process-wide index from publicly exposed endpoints
//! (hostnames and TCP ports) to the tunnel that owns them. Listeners derive
//! a fingerprint from each incoming request, resolve it here, and ask the
//! owning session for a proxy channel. The registry holds lookup handles
//! only; every tunnel is exclusively owned by its control session.

pub mod host;
pub mod ports;
pub mod registry;
pub mod sni;

pub use host::{canonical_host, random_subdomain};
pub use ports::{PortAllocator, PortError};
pub use registry::{Endpoint, ProxyError, ProxyRequest, RegistryError, TunnelInfo, TunnelRegistry};
pub use sni::{extract_sni, SniError};
