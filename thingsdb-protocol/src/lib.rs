//! # thingsdb-protocol
//!
//! Wire protocol implementation for ThingsDB socket connections.
//!
//! This crate provides:
//! - Fixed 8-byte framing with a type/complement checksum
//! - Request and response packet type enumerations
//! - MessagePack payload encoding/decoding
//! - Server error codes and push event interpretation

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder, MsgPack};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameHeader, FRAME_HEADER_SIZE};
pub use message::{ErrorPayload, Event, RequestType, Response, ResponseType};

/// Default port of the ThingsDB client socket.
pub const DEFAULT_PORT: u16 = 9200;

/// Maximum frame payload size (64 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Largest request ID handed out before the counter wraps back to 1.
pub const MAX_REQUEST_ID: u16 = u16::MAX;
