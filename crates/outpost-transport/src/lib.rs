//! Framed connection transport
//!
//! A control transport is a single byte stream (TCP, optionally TLS) that
//! carries length-prefixed control messages. This crate provides the framed
//! reader/writer split used by control sessions, the raw proxy stream a
//! dialed-back transport degrades into, and the splice loops that move
//! public traffic through a proxy channel.

pub mod framed;
pub mod splice;
pub mod tls;

pub use framed::{BoxedStream, FramedConnection, FramedReader, FramedWriter, IoStream, ProxyStream};
pub use splice::splice;
pub use tls::build_tls_acceptor;

use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] outpost_proto::CodecError),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}
