//! Binary frame format.
//!
//! Frame layout (8 bytes header + optional payload):
//!
//! ```text
//! +-------------+---------+--------+------------+
//! | payload_len |   id    |  type  | type_check |
//! | 4 bytes LE  | 2 bytes | 1 byte |   1 byte   |
//! +-------------+---------+--------+------------+
//! | payload (MessagePack), payload_len bytes    |
//! +---------------------------------------------+
//! ```
//!
//! `type_check` is always the bitwise complement of `type`.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes (4+2+1+1 = 8).
pub const FRAME_HEADER_SIZE: usize = 8;

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Number of payload bytes following the header.
    pub length: u32,
    /// Request or response ID.
    pub id: u16,
    /// Packet type.
    pub frame_type: i8,
    /// Complement of `frame_type`.
    pub type_check: i8,
}

impl FrameHeader {
    /// Builds a header for `payload_len` bytes of payload.
    pub fn new(id: u16, frame_type: i8, payload_len: u32) -> Self {
        Self {
            length: payload_len,
            id,
            frame_type,
            type_check: !frame_type,
        }
    }

    /// Writes the header in wire order.
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.length);
        buf.put_u16_le(self.id);
        buf.put_i8(self.frame_type);
        buf.put_i8(self.type_check);
    }

    /// Unpacks a header. The caller reads `length` more bytes when non-zero.
    pub fn decode(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let id = u16::from_le_bytes([bytes[4], bytes[5]]);
        let frame_type = bytes[6] as i8;
        let type_check = bytes[7] as i8;

        if frame_type != !type_check {
            return Err(ProtocolError::MalformedFrame {
                type_byte: bytes[6],
                check_byte: bytes[7],
            });
        }

        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            length,
            id,
            frame_type,
            type_check,
        })
    }
}

/// A complete frame: header fields plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request or response ID.
    pub id: u16,
    /// Packet type.
    pub frame_type: i8,
    /// Raw payload (MessagePack). Empty when the header length is zero.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: u16, frame_type: i8, payload: Bytes) -> Self {
        Self {
            id,
            frame_type,
            payload,
        }
    }

    /// Creates a frame with no payload.
    pub fn empty(id: u16, frame_type: i8) -> Self {
        Self::new(id, frame_type, Bytes::new())
    }

    /// Returns the header describing this frame.
    pub fn header(&self) -> Result<FrameHeader, ProtocolError> {
        let length = payload_len(self.payload.len())?;
        Ok(FrameHeader::new(self.id, self.frame_type, length))
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        encode(self.id, self.frame_type, &self.payload)
    }

    /// Decodes a frame from a byte buffer.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on a corrupt header.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::decode(&raw)?;

        let total_len = FRAME_HEADER_SIZE + header.length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length as usize).freeze();

        Ok(Some(Self {
            id: header.id,
            frame_type: header.frame_type,
            payload,
        }))
    }
}

/// Encodes a header followed by `payload`. An empty payload writes the header only.
pub fn encode(id: u16, frame_type: i8, payload: &[u8]) -> Result<BytesMut, ProtocolError> {
    let length = payload_len(payload.len())?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    FrameHeader::new(id, frame_type, length).write(&mut buf);
    buf.put_slice(payload);
    Ok(buf)
}

/// Checks a payload size against `MAX_PAYLOAD_SIZE`.
fn payload_len(len: usize) -> Result<u32, ProtocolError> {
    match u32::try_from(len) {
        Ok(size) if size <= MAX_PAYLOAD_SIZE => Ok(size),
        _ => Err(ProtocolError::FrameTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: MAX_PAYLOAD_SIZE,
        }),
    }
}
