//! Control protocol for outpost tunnels
//!
//! Defines the message set exchanged between tunnel clients and the relay
//! server, and the length-prefixed wire codec that carries them.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ControlCodec, MAX_MESSAGE_SIZE};
pub use messages::{
    Auth, AuthResp, ControlMessage, NewTunnel, Ping, Pong, Protocol, RegProxy, ReqProxy,
    ReqTunnel, StartProxy,
};
