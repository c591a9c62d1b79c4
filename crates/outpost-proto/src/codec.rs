//! Wire codec for control messages
//!
//! Format: `[length: u64 little-endian][envelope: JSON]`. The length counts
//! the envelope bytes only. Decoding is incremental so a reader can feed
//! partial network reads into the same buffer.

use crate::messages::ControlMessage;
use bytes::{Buf, Bytes, BytesMut};
use serde::Deserialize;
use thiserror::Error;

/// Maximum envelope size (1 MiB). Control traffic is tiny; anything larger
/// indicates a corrupt or hostile peer.
pub const MAX_MESSAGE_SIZE: u64 = 1024 * 1024;

/// Width of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Codec errors
///
/// `FrameTooLarge` and `MalformedFrame` are framing errors and fatal to the
/// transport that produced them. `UnknownMessage` means the frame itself was
/// well formed but the discriminator is outside the registered set; it is
/// fatal to the session, not to message framing in general.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    FrameTooLarge(u64),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown message type: {0}")]
    UnknownMessage(String),

    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl CodecError {
    /// True for errors after which no further frame can be trusted
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            CodecError::FrameTooLarge(_) | CodecError::MalformedFrame(_)
        )
    }
}

/// Minimal probe used to classify a frame before full deserialization
#[derive(Deserialize)]
struct EnvelopeProbe {
    #[serde(rename = "Type")]
    type_name: String,
}

/// Control message codec
pub struct ControlCodec;

impl ControlCodec {
    /// Encode a message to its wire form
    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let envelope = serde_json::to_vec(msg).map_err(CodecError::Serialize)?;

        if envelope.len() as u64 > MAX_MESSAGE_SIZE {
            return Err(CodecError::FrameTooLarge(envelope.len() as u64));
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + envelope.len());
        buf.extend_from_slice(&(envelope.len() as u64).to_le_bytes());
        buf.extend_from_slice(&envelope);

        Ok(buf.freeze())
    }

    /// Decode one message from the front of `buf`
    ///
    /// Returns `Ok(Some(message))` when a complete frame was consumed,
    /// `Ok(None)` when more bytes are needed, and `Err` on a framing or
    /// protocol failure. On error the frame bytes are left consumed; the
    /// caller must treat the stream as dead.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
        let length = u64::from_le_bytes(length_bytes);

        if length > MAX_MESSAGE_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }
        let length = length as usize;

        if buf.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let envelope = buf.split_to(length);

        // Probe the discriminator first so an unregistered type is reported
        // as "unknown message" rather than a generic parse failure.
        let probe: EnvelopeProbe = serde_json::from_slice(&envelope)
            .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;

        if !ControlMessage::KNOWN_TYPES.contains(&probe.type_name.as_str()) {
            return Err(CodecError::UnknownMessage(probe.type_name));
        }

        let msg: ControlMessage = serde_json::from_slice(&envelope)
            .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;

        Ok(Some(msg))
    }
}
