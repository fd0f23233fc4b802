//! Packet types, responses and push events.

use crate::codec::MsgPack;
use crate::error::{ErrorCode, ProtocolError};
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Packet types sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum RequestType {
    Ping = 32,
    Auth = 33,
    Query = 34,
    Run = 37,
    Join = 38,
    Leave = 39,
    Emit = 40,
}

impl RequestType {
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    /// Response type a successful request of this kind answers with.
    pub fn expected_response(self) -> ResponseType {
        match self {
            RequestType::Ping => ResponseType::Pong,
            RequestType::Auth | RequestType::Emit => ResponseType::Ok,
            RequestType::Query | RequestType::Run | RequestType::Join | RequestType::Leave => {
                ResponseType::Data
            }
        }
    }
}

impl TryFrom<i8> for RequestType {
    type Error = ProtocolError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        Ok(match value {
            32 => RequestType::Ping,
            33 => RequestType::Auth,
            34 => RequestType::Query,
            37 => RequestType::Run,
            38 => RequestType::Join,
            39 => RequestType::Leave,
            40 => RequestType::Emit,
            other => return Err(ProtocolError::UnknownRequestType(other)),
        })
    }
}

/// Packet types sent by the server.
///
/// `Pong`, `Ok`, `Data` and `Error` answer a request and carry its ID.
/// The remaining types are pushed by the server on its own initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ResponseType {
    NodeStatus = 0,
    Warning = 5,
    OnJoin = 6,
    OnLeave = 7,
    OnEmit = 8,
    OnDelete = 9,

    Pong = 16,
    Ok = 17,
    Data = 18,
    Error = 19,
}

impl ResponseType {
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    /// Returns whether this type answers a client request.
    pub fn is_solicited(self) -> bool {
        matches!(
            self,
            ResponseType::Pong | ResponseType::Ok | ResponseType::Data | ResponseType::Error
        )
    }

    /// Returns whether this type is pushed by the server unprompted.
    pub fn is_push(self) -> bool {
        !self.is_solicited()
    }
}

impl TryFrom<i8> for ResponseType {
    type Error = ProtocolError;

    fn try_from(value: i8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => ResponseType::NodeStatus,
            5 => ResponseType::Warning,
            6 => ResponseType::OnJoin,
            7 => ResponseType::OnLeave,
            8 => ResponseType::OnEmit,
            9 => ResponseType::OnDelete,
            16 => ResponseType::Pong,
            17 => ResponseType::Ok,
            18 => ResponseType::Data,
            19 => ResponseType::Error,
            other => return Err(ProtocolError::UnknownResponseType(other)),
        })
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseType::NodeStatus => "NODE_STATUS",
            ResponseType::Warning => "WARNING",
            ResponseType::OnJoin => "ON_JOIN",
            ResponseType::OnLeave => "ON_LEAVE",
            ResponseType::OnEmit => "ON_EMIT",
            ResponseType::OnDelete => "ON_DELETE",
            ResponseType::Pong => "PONG",
            ResponseType::Ok => "OK",
            ResponseType::Data => "DATA",
            ResponseType::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Payload of an ERROR packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_code: i64,
    pub error_msg: String,
}

impl ErrorPayload {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::from_code(self.error_code)
    }
}

/// A decoded server packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u16,
    pub kind: ResponseType,
    /// Decoded payload, `None` when the packet had no body.
    pub data: Option<Value>,
}

impl Response {
    pub fn new(id: u16, kind: ResponseType, data: Option<Value>) -> Self {
        Self { id, kind, data }
    }

    /// Decodes a frame's type and MessagePack payload.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let kind = ResponseType::try_from(frame.frame_type)?;
        let data = if frame.payload.is_empty() {
            None
        } else {
            Some(MsgPack::decode::<Value>(&frame.payload)?)
        };
        Ok(Self::new(frame.id, kind, data))
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResponseType::Error
    }

    /// Returns the structured error of an ERROR packet.
    pub fn error_payload(&self) -> Result<Option<ErrorPayload>, ProtocolError> {
        if !self.is_error() {
            return Ok(None);
        }
        let data = self
            .data
            .clone()
            .ok_or_else(|| ProtocolError::InvalidPayload("ERROR packet without payload".into()))?;
        serde_json::from_value(data)
            .map(Some)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    /// Consumes the response and returns its payload, `Null` when absent.
    pub fn into_value(self) -> Value {
        self.data.unwrap_or(Value::Null)
    }
}

/// Server push events.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NodeStatus(String),
    Warning { code: i64, message: String },
    Join { room_id: u64 },
    Leave { room_id: u64 },
    Emit {
        room_id: u64,
        event: String,
        args: Vec<Value>,
    },
    Delete { room_id: u64 },
}

#[derive(Deserialize)]
struct RoomPayload {
    id: u64,
}

#[derive(Deserialize)]
struct EmitPayload {
    id: u64,
    event: String,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Deserialize)]
struct WarningPayload {
    warn_code: i64,
    warn_msg: String,
}

impl Event {
    /// Interprets a push packet. Returns `Ok(None)` for solicited responses.
    pub fn from_response(response: &Response) -> Result<Option<Self>, ProtocolError> {
        if response.kind.is_solicited() {
            return Ok(None);
        }

        let data = response.data.clone().unwrap_or(Value::Null);
        let event = match response.kind {
            ResponseType::NodeStatus => match data {
                Value::String(status) => Event::NodeStatus(status),
                other => {
                    return Err(ProtocolError::InvalidPayload(format!(
                        "NODE_STATUS expects a string, got {}",
                        other
                    )))
                }
            },
            ResponseType::Warning => {
                let w: WarningPayload = from_payload(data)?;
                Event::Warning {
                    code: w.warn_code,
                    message: w.warn_msg,
                }
            }
            ResponseType::OnJoin => Event::Join {
                room_id: from_payload::<RoomPayload>(data)?.id,
            },
            ResponseType::OnLeave => Event::Leave {
                room_id: from_payload::<RoomPayload>(data)?.id,
            },
            ResponseType::OnDelete => Event::Delete {
                room_id: from_payload::<RoomPayload>(data)?.id,
            },
            ResponseType::OnEmit => {
                let e: EmitPayload = from_payload(data)?;
                Event::Emit {
                    room_id: e.id,
                    event: e.event,
                    args: e.args,
                }
            }
            ResponseType::Pong | ResponseType::Ok | ResponseType::Data | ResponseType::Error => {
                return Ok(None)
            }
        };
        Ok(Some(event))
    }

    /// Room this event belongs to, if any.
    pub fn room_id(&self) -> Option<u64> {
        match self {
            Event::Join { room_id }
            | Event::Leave { room_id }
            | Event::Delete { room_id }
            | Event::Emit { room_id, .. } => Some(*room_id),
            Event::NodeStatus(_) | Event::Warning { .. } => None,
        }
    }
}

fn from_payload<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}
