//! Protocol error types and server error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or payload handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: type {type_byte:#04x} does not match check {check_byte:#04x}")]
    MalformedFrame { type_byte: u8, check_byte: u8 },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("unknown request type: {0}")]
    UnknownRequestType(i8),

    #[error("unknown response type: {0}")]
    UnknownResponseType(i8),

    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl ProtocolError {
    /// Returns whether the byte stream can no longer be trusted to be frame-aligned.
    pub fn is_stream_corrupt(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedFrame { .. } | ProtocolError::FrameTooLarge { .. }
        )
    }
}

/// Error codes reported by the server in ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    CancelledError,
    OperationError,
    NumArgumentsError,
    TypeError,
    ValueError,
    OverflowError,
    ZeroDivError,
    MaxQuotaError,
    AuthError,
    ForbiddenError,
    LookupError,
    BadDataError,
    SyntaxError,
    NodeError,
    AssertionError,

    // Internal errors
    ResultTooLarge,
    RequestTimeout,
    RequestCancel,
    WriteUvError,
    MemoryError,
    InternalError,

    /// A code this client does not know about.
    Other(i64),
}

impl ErrorCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            -64 => ErrorCode::CancelledError,
            -63 => ErrorCode::OperationError,
            -62 => ErrorCode::NumArgumentsError,
            -61 => ErrorCode::TypeError,
            -60 => ErrorCode::ValueError,
            -59 => ErrorCode::OverflowError,
            -58 => ErrorCode::ZeroDivError,
            -57 => ErrorCode::MaxQuotaError,
            -56 => ErrorCode::AuthError,
            -55 => ErrorCode::ForbiddenError,
            -54 => ErrorCode::LookupError,
            -53 => ErrorCode::BadDataError,
            -52 => ErrorCode::SyntaxError,
            -51 => ErrorCode::NodeError,
            -50 => ErrorCode::AssertionError,
            -6 => ErrorCode::ResultTooLarge,
            -5 => ErrorCode::RequestTimeout,
            -4 => ErrorCode::RequestCancel,
            -3 => ErrorCode::WriteUvError,
            -2 => ErrorCode::MemoryError,
            -1 => ErrorCode::InternalError,
            other => ErrorCode::Other(other),
        }
    }

    /// Returns the numeric code as sent on the wire.
    pub fn code(&self) -> i64 {
        match self {
            ErrorCode::CancelledError => -64,
            ErrorCode::OperationError => -63,
            ErrorCode::NumArgumentsError => -62,
            ErrorCode::TypeError => -61,
            ErrorCode::ValueError => -60,
            ErrorCode::OverflowError => -59,
            ErrorCode::ZeroDivError => -58,
            ErrorCode::MaxQuotaError => -57,
            ErrorCode::AuthError => -56,
            ErrorCode::ForbiddenError => -55,
            ErrorCode::LookupError => -54,
            ErrorCode::BadDataError => -53,
            ErrorCode::SyntaxError => -52,
            ErrorCode::NodeError => -51,
            ErrorCode::AssertionError => -50,
            ErrorCode::ResultTooLarge => -6,
            ErrorCode::RequestTimeout => -5,
            ErrorCode::RequestCancel => -4,
            ErrorCode::WriteUvError => -3,
            ErrorCode::MemoryError => -2,
            ErrorCode::InternalError => -1,
            ErrorCode::Other(code) => *code,
        }
    }

    /// Returns whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NodeError | ErrorCode::RequestTimeout | ErrorCode::RequestCancel
        )
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        ErrorCode::from_code(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Other(code) => write!(f, "ERROR({})", code),
            known => write!(f, "{:?}({})", known, known.code()),
        }
    }
}
