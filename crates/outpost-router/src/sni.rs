//! SNI extraction from a raw TLS ClientHello
//!
//! The HTTPS listener needs the server name before any TLS state exists, so
//! this walks the ClientHello by hand: record header, handshake header,
//! then the extension list until the server_name extension turns up.

use thiserror::Error;

/// SNI extraction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("not a TLS handshake record")]
    NotAHandshake,

    #[error("truncated or malformed ClientHello")]
    Malformed,

    #[error("ClientHello carries no server name")]
    NoServerName,

    #[error("server name is not valid UTF-8 or is empty")]
    InvalidServerName,
}

const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}

/// Extract the SNI hostname from the bytes of a TLS ClientHello record
pub fn extract_sni(record: &[u8]) -> Result<String, SniError> {
    let mut cur = Cursor::new(record);

    // Record header: type, legacy version, length
    if cur.u8().ok_or(SniError::Malformed)? != RECORD_TYPE_HANDSHAKE {
        return Err(SniError::NotAHandshake);
    }
    cur.skip(2).ok_or(SniError::Malformed)?;
    cur.skip(2).ok_or(SniError::Malformed)?;

    // Handshake header: type, 24-bit length
    if cur.u8().ok_or(SniError::Malformed)? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(SniError::NotAHandshake);
    }
    cur.skip(3).ok_or(SniError::Malformed)?;

    // ClientHello body: version, random, session id, cipher suites,
    // compression methods
    cur.skip(2).ok_or(SniError::Malformed)?;
    cur.skip(32).ok_or(SniError::Malformed)?;

    let session_id_len = cur.u8().ok_or(SniError::Malformed)? as usize;
    cur.skip(session_id_len).ok_or(SniError::Malformed)?;

    let cipher_suites_len = cur.u16().ok_or(SniError::Malformed)? as usize;
    cur.skip(cipher_suites_len).ok_or(SniError::Malformed)?;

    let compression_len = cur.u8().ok_or(SniError::Malformed)? as usize;
    cur.skip(compression_len).ok_or(SniError::Malformed)?;

    // Extension list
    let extensions_len = cur.u16().ok_or(SniError::NoServerName)? as usize;
    let extensions = cur.take(extensions_len).ok_or(SniError::Malformed)?;

    let mut ext = Cursor::new(extensions);
    loop {
        let ext_type = match ext.u16() {
            Some(t) => t,
            None => return Err(SniError::NoServerName),
        };
        let ext_len = ext.u16().ok_or(SniError::Malformed)? as usize;
        let ext_data = ext.take(ext_len).ok_or(SniError::Malformed)?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(ext_data);
        }
    }
}

fn parse_server_name(data: &[u8]) -> Result<String, SniError> {
    let mut cur = Cursor::new(data);

    let list_len = cur.u16().ok_or(SniError::Malformed)? as usize;
    let list = cur.take(list_len).ok_or(SniError::Malformed)?;

    let mut entry = Cursor::new(list);
    while let Some(name_type) = entry.u8() {
        let name_len = entry.u16().ok_or(SniError::Malformed)? as usize;
        let name = entry.take(name_len).ok_or(SniError::Malformed)?;

        if name_type == NAME_TYPE_HOST {
            let host =
                std::str::from_utf8(name).map_err(|_| SniError::InvalidServerName)?;
            if host.is_empty() {
                return Err(SniError::InvalidServerName);
            }
            return Ok(host.to_string());
        }
    }

    Err(SniError::NoServerName)
}

#[cfg(test)]
pub(crate) fn build_client_hello(sni: Option<&str>) -> Vec<u8> {
    // Handcrafted minimal ClientHello, lengths fixed up after the fact
    let mut hello = Vec::new();

    hello.push(0x03); // client version
    hello.push(0x03);
    hello.extend_from_slice(&[0u8; 32]); // random
    hello.push(0x00); // empty session id
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
    hello.extend_from_slice(&[0x01, 0x00]); // null compression

    let mut extensions = Vec::new();
    if let Some(name) = sni {
        let name_bytes = name.as_bytes();
        let entry_len = 3 + name_bytes.len();
        extensions.extend_from_slice(&[0x00, 0x00]); // server_name
        extensions.extend_from_slice(&((entry_len + 2) as u16).to_be_bytes());
        extensions.extend_from_slice(&(entry_len as u16).to_be_bytes());
        extensions.push(0x00); // host_name
        extensions.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
        extensions.extend_from_slice(name_bytes);
    }
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
