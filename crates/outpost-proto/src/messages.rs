//! Protocol message types
//!
//! Every message travels as a JSON envelope `{"Type": ..., "Payload": ...}`.
//! The envelope shape is produced by serde's adjacent tagging, so the enum
//! below is the single source of truth for the discriminator set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Main control protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "Type", content = "Payload")]
pub enum ControlMessage {
    /// First message on a control transport (client -> server)
    Auth(Auth),
    /// Handshake reply (server -> client)
    AuthResp(AuthResp),
    /// Request a new public endpoint (client -> server)
    ReqTunnel(ReqTunnel),
    /// Bind result (server -> client)
    NewTunnel(NewTunnel),
    /// Ask the client to dial back a proxy transport (server -> client)
    ReqProxy(ReqProxy),
    /// First message on a dialed-back proxy transport (client -> server)
    RegProxy(RegProxy),
    /// Activates a proxy transport for one public connection (server -> client)
    StartProxy(StartProxy),
    /// Heartbeat (both directions)
    Ping(Ping),
    /// Heartbeat echo (both directions)
    Pong(Pong),
}

impl ControlMessage {
    /// The wire discriminator of this message
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::Auth(_) => "Auth",
            ControlMessage::AuthResp(_) => "AuthResp",
            ControlMessage::ReqTunnel(_) => "ReqTunnel",
            ControlMessage::NewTunnel(_) => "NewTunnel",
            ControlMessage::ReqProxy(_) => "ReqProxy",
            ControlMessage::RegProxy(_) => "RegProxy",
            ControlMessage::StartProxy(_) => "StartProxy",
            ControlMessage::Ping(_) => "Ping",
            ControlMessage::Pong(_) => "Pong",
        }
    }

    /// All discriminators this codec understands
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "Auth",
        "AuthResp",
        "ReqTunnel",
        "NewTunnel",
        "ReqProxy",
        "RegProxy",
        "StartProxy",
        "Ping",
        "Pong",
    ];
}

/// Client handshake: identity plus the shared-secret password
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct Auth {
    pub version: String,
    pub mm_version: String,
    pub user: String,
    pub password: String,
    #[serde(rename = "OS")]
    pub os: String,
    pub arch: String,
    /// Ignored by the server; a fresh id is always generated
    pub client_id: String,
}

/// Handshake reply; a non-empty `Error` is fatal to the session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthResp {
    pub version: String,
    pub mm_version: String,
    pub client_id: String,
    pub error: String,
}

/// Request one public endpoint. `Protocol` stays a plain string on the wire
/// so an unsupported value is a per-request bind error, not a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReqTunnel {
    pub req_id: String,
    pub protocol: String,
    pub hostname: String,
    pub subdomain: String,
    pub http_auth: String,
    pub remote_port: u16,
}

/// Bind result; a non-empty `Error` means the request failed and no
/// endpoint was registered
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewTunnel {
    pub req_id: String,
    pub url: String,
    pub protocol: String,
    pub error: String,
}

/// Empty payload: the rendezvous is matched FIFO per session, tickets never
/// travel on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReqProxy {}

/// Tags a freshly dialed transport with its owning session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct RegProxy {
    pub client_id: String,
}

/// Tells the client which tunnel the following byte stream belongs to
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct StartProxy {
    pub url: String,
    pub client_addr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Ping {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Pong {}

/// Protocol classes a tunnel can be bound as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Http,
    Https,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "udp" => Ok(Protocol::Udp),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

/// Error for protocol strings outside the supported set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tunnel protocol: {0}")]
pub struct UnknownProtocol(pub String);
