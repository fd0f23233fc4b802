//! High-level client API.

use crate::connection::{
    expect_kind, Connection, ConnectionConfig, Credentials, ListenTimeout,
};
use crate::error::ClientError;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use thingsdb_protocol::{Event, RequestType, Response, ResponseType};

/// High-level client for ThingsDB.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn request(
        &self,
        request_type: RequestType,
        payload: Option<Value>,
    ) -> Result<Response, ClientError> {
        let response = self.conn.request(request_type, payload.as_ref()).await?;
        expect_kind(response, request_type.expected_response())
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(RequestType::Ping, None).await?;
        Ok(())
    }

    /// Keep-alive ping: any failure is reported as `false`.
    pub async fn ping_ok(&self) -> bool {
        match self.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Ping failed: {}", e);
                false
            }
        }
    }

    /// Authenticates with a username and password.
    pub async fn auth(&self, username: &str, password: &str) -> Result<(), ClientError> {
        self.conn
            .authenticate(&Credentials::Password {
                username: username.to_string(),
                password: password.to_string(),
            })
            .await
    }

    /// Authenticates with a token.
    pub async fn auth_token(&self, token: &str) -> Result<(), ClientError> {
        self.conn
            .authenticate(&Credentials::Token(token.to_string()))
            .await
    }

    // =========================================================================
    // Queries and procedures
    // =========================================================================

    /// Runs `code` in `scope` and returns the result.
    pub async fn query(
        &self,
        scope: &str,
        code: &str,
        vars: Option<Value>,
    ) -> Result<Value, ClientError> {
        let payload = match vars {
            Some(vars) if !is_empty(&vars) => json!([scope, code, vars]),
            _ => json!([scope, code]),
        };
        let response = self.request(RequestType::Query, Some(payload)).await?;
        Ok(response.into_value())
    }

    /// Runs a query and deserializes its result.
    pub async fn query_as<T: DeserializeOwned>(
        &self,
        scope: &str,
        code: &str,
        vars: Option<Value>,
    ) -> Result<T, ClientError> {
        let value = self.query(scope, code, vars).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Runs a stored procedure.
    pub async fn run(
        &self,
        scope: &str,
        procedure: &str,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        let payload = json!([scope, procedure, args]);
        let response = self.request(RequestType::Run, Some(payload)).await?;
        Ok(response.into_value())
    }

    // =========================================================================
    // Rooms
    // =========================================================================

    /// Joins rooms. Returns one entry per requested room, `None` where the
    /// room was not found.
    pub async fn join(&self, scope: &str, room_ids: &[u64]) -> Result<Vec<Option<u64>>, ClientError> {
        self.room_request(RequestType::Join, scope, room_ids).await
    }

    /// Leaves rooms. Returns one entry per requested room, `None` where the
    /// room was not found.
    pub async fn leave(
        &self,
        scope: &str,
        room_ids: &[u64],
    ) -> Result<Vec<Option<u64>>, ClientError> {
        self.room_request(RequestType::Leave, scope, room_ids).await
    }

    async fn room_request(
        &self,
        request_type: RequestType,
        scope: &str,
        room_ids: &[u64],
    ) -> Result<Vec<Option<u64>>, ClientError> {
        let mut payload = vec![json!(scope)];
        payload.extend(room_ids.iter().map(|id| json!(id)));

        let response = self
            .request(request_type, Some(Value::Array(payload)))
            .await?;
        Ok(serde_json::from_value(response.into_value())?)
    }

    /// Emits an event to a room.
    pub async fn emit(
        &self,
        scope: &str,
        room_id: u64,
        event: &str,
        args: Vec<Value>,
    ) -> Result<(), ClientError> {
        let mut payload = vec![json!(scope), json!(room_id), json!(event)];
        payload.extend(args);

        self.request(RequestType::Emit, Some(Value::Array(payload)))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Waits for the next unsolicited packet.
    pub async fn listen(&self, timeout: ListenTimeout) -> Result<Option<Response>, ClientError> {
        self.conn.listen(timeout).await
    }

    /// Waits for the next push event.
    ///
    /// A stray solicited packet (for example a response that arrived for a
    /// request nobody waits on any more) is skipped.
    pub async fn listen_event(&self, timeout: ListenTimeout) -> Result<Option<Event>, ClientError> {
        loop {
            let Some(response) = self.conn.listen(timeout).await? else {
                return Ok(None);
            };
            match Event::from_response(&response)? {
                Some(event) => return Ok(Some(event)),
                None => {
                    tracing::debug!(
                        "Skipping {} id={} while listening for events",
                        response.kind,
                        response.id
                    );
                    if response.kind == ResponseType::Error {
                        tracing::warn!("Unclaimed error response id={}", response.id);
                    }
                }
            }
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
