//! Binary frame format.
//!
//! Frame layout (2 bytes header + payload):
//!
//! ```text
//! +-------------+--------------------------------+
//! | payload_len | payload (UTF-8 JSON)           |
//! | 2 bytes, BE | payload_len bytes              |
//! +-------------+--------------------------------+
//! ```

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Reads the payload length from a frame header.
pub fn decode_length(header: [u8; LENGTH_PREFIX_SIZE]) -> u16 {
    u16::from_be_bytes(header)
}

/// A single length-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame payload (JSON data).
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given payload.
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Creates a new frame from a JSON-serializable value.
    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(Bytes::from(payload)))
    }

    /// Returns the payload length.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPayload {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload_len);
        buf.put_u16(payload_len as u16);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `None` if `buf` does not yet hold the whole frame. Consumes
    /// exactly the header plus the declared payload length and nothing more.
    pub fn decode(buf: &mut BytesMut) -> Option<Self> {
        let header: [u8; LENGTH_PREFIX_SIZE] = buf.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
        let payload_len = decode_length(header) as usize;

        if buf.len() < LENGTH_PREFIX_SIZE + payload_len {
            return None;
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Some(Self { payload })
    }

    /// Returns how many more bytes `buf` needs before a frame completes.
    ///
    /// Zero means a complete frame is buffered.
    pub fn bytes_needed(buf: &[u8]) -> usize {
        match buf.get(..LENGTH_PREFIX_SIZE) {
            None => LENGTH_PREFIX_SIZE - buf.len(),
            Some(header) => {
                let payload_len = u16::from_be_bytes([header[0], header[1]]) as usize;
                (LENGTH_PREFIX_SIZE + payload_len).saturating_sub(buf.len())
            }
        }
    }
}
