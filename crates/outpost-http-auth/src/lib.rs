//! HTTP Basic Authentication for tunnels
//!
//! A tunnel may be bound with a single `user:password` credential. Public
//! requests are then gated at the listener: the Authorization header is
//! validated here and a failed check is answered with a `401` without ever
//! engaging the tunnel client.
//!
//! Basic credentials are an encoding, not encryption; they only make sense
//! on the HTTPS listener or behind a trusted edge.

pub mod basic;
pub mod header;

pub use basic::BasicAuth;
pub use header::{find_header, parse_request_headers};
