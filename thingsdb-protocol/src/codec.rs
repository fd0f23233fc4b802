//! Encoder and decoder for frames and MessagePack payloads.

use crate::error::ProtocolError;
use crate::frame::{self, Frame};
use crate::message::{RequestType, Response, ResponseType};
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// MessagePack payload codec.
///
/// Structs are written as maps (`to_vec_named`) so field names survive the
/// trip to the server.
pub struct MsgPack;

impl MsgPack {
    /// Encodes a value to MessagePack bytes.
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decodes MessagePack bytes to a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Encodes requests and responses into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a request. `None` sends a header-only frame.
    pub fn encode_request<T: Serialize + ?Sized>(
        id: u16,
        request_type: RequestType,
        payload: Option<&T>,
    ) -> Result<BytesMut, ProtocolError> {
        let body = match payload {
            Some(value) => MsgPack::encode(value)?,
            None => Vec::new(),
        };
        frame::encode(id, request_type.as_i8(), &body)
    }

    /// Encodes a server packet. Used by test servers and benchmarks.
    pub fn encode_response<T: Serialize + ?Sized>(
        id: u16,
        response_type: ResponseType,
        payload: Option<&T>,
    ) -> Result<BytesMut, ProtocolError> {
        let body = match payload {
            Some(value) => MsgPack::encode(value)?,
            None => Vec::new(),
        };
        frame::encode(id, response_type.as_i8(), &body)
    }
}

/// Accumulates bytes and yields complete frames.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next server packet from the buffer.
    pub fn decode_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(Response::from_frame(&frame)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
