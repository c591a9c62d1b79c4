//! Public HTTP listener
//!
//! Classifies each accepted stream by its Host header, resolves the tunnel,
//! and splices the stream through a proxy channel dialed back by the owning
//! client. The HTTPS listener reuses the head parsing and the serving path
//! here once TLS is terminated.

pub mod head;
pub mod server;

pub use head::{read_request_head, HeadError, RequestHead, MAX_HEAD_SIZE};
pub use server::{respond_status, serve_tunnel, HttpServer, HttpServerError};
