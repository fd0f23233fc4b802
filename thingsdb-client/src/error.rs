//! Client error types.

use thingsdb_protocol::{ErrorCode, ProtocolError, ResponseType};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect timeout")]
    Timeout,

    #[error("request {id} timed out")]
    RequestTimeout { id: u16 },

    #[error("server error: {code} - {message}")]
    ServerError { code: ErrorCode, message: String },

    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: ResponseType,
        actual: ResponseType,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns whether the connection must be re-established after this error.
    ///
    /// A corrupt frame header counts: the byte stream is no longer aligned.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::ConnectionClosed => true,
            ClientError::TlsHandshake(_) => true,
            ClientError::Protocol(e) => e.is_stream_corrupt(),
            _ => false,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::RequestTimeout { .. } => true,
            ClientError::ConnectionClosed => true,
            ClientError::ServerError { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    /// Returns the server error code, if this is a server-reported failure.
    pub fn server_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::ServerError { code, .. } => Some(*code),
            _ => None,
        }
    }
}
