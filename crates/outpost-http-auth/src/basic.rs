//! Basic auth validation against a tunnel's configured credential

use base64::Engine;
use tracing::debug;

const DEFAULT_REALM: &str = "outpost";

/// Validator for one tunnel's `user:password` credential
pub struct BasicAuth {
    credential: String,
    realm: String,
}

impl BasicAuth {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            realm: DEFAULT_REALM.to_string(),
        }
    }

    pub fn with_realm(credential: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            realm: realm.into(),
        }
    }

    /// Check an `Authorization` header value, if any was sent
    pub fn check(&self, authorization: Option<&str>) -> bool {
        let Some(value) = authorization else {
            debug!("basic auth: no Authorization header");
            return false;
        };

        match decode_basic(value) {
            Some(credential) => {
                if credential == self.credential {
                    true
                } else {
                    debug!("basic auth: credential mismatch");
                    false
                }
            }
            None => {
                debug!("basic auth: unparseable Authorization header");
                false
            }
        }
    }

    /// Raw `401` response sent to the public caller on a failed check
    pub fn unauthorized_response(&self) -> Vec<u8> {
        let body = "Authentication required\n";
        format!(
            "HTTP/1.1 401 Unauthorized\r\n\
             WWW-Authenticate: Basic realm=\"{}\"\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            self.realm.replace('"', "\\\""),
            body.len(),
            body
        )
        .into_bytes()
    }
}

/// Decode `Basic <base64>` into the `user:password` string
fn decode_basic(header_value: &str) -> Option<String> {
    let value = header_value.trim();
    let scheme = value.get(..6)?;
    if !scheme.eq_ignore_ascii_case("basic ") {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value[6..].trim())
        .ok()?;
    String::from_utf8(decoded).ok()
}
