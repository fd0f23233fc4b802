//! # thingsdb-client
//!
//! Client library for ThingsDB.
//!
//! This crate provides:
//! - Async TCP client with optional TLS
//! - Request/response correlation over a single socket
//! - Room events (join/leave/emit/delete) via `listen`
//! - High-level API for ping, auth, query, run and rooms

pub mod buffer;
pub mod client;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod stream;
pub mod tls;
pub mod transport;

pub use buffer::NotificationBuffer;
pub use client::Client;
pub use connection::{
    Connection, ConnectionConfig, ConnectionState, Credentials, ListenTimeout, TlsClientConfig,
};
pub use error::ClientError;
pub use thingsdb_protocol::{ErrorCode, Event, Response, ResponseType};
