//! Public HTTPS listener
//!
//! Routes on the ClientHello SNI before any TLS state exists, terminates
//! TLS with the server's configured certificate, then hands the decrypted
//! stream to the HTTP serving path.

pub mod server;

pub use server::{HttpsServer, HttpsServerError};
