//! Connection management.

use crate::correlation::{Correlator, Routed};
use crate::error::ClientError;
use crate::transport::{self, Transport};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use thingsdb_protocol::{Encoder, Frame, RequestType, Response, ResponseType, DEFAULT_PORT};
use tokio::time::Instant;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// TLS configuration for client connections.
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the bundled web PKI roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Verify the server certificate at all. Disabling is INSECURE.
    pub verify_peer: bool,
    /// Accept a self-signed server certificate.
    pub allow_self_signed: bool,
    /// Check that the certificate matches the server name.
    pub verify_hostname: bool,
    /// Server name for SNI (defaults to the connection host).
    pub server_name: Option<String>,
}

impl Default for TlsClientConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            verify_peer: true,
            allow_self_signed: false,
            verify_hostname: true,
            server_name: None,
        }
    }
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.verify_peer = false;
        self
    }

    pub fn with_self_signed(mut self) -> Self {
        self.allow_self_signed = true;
        self
    }

    pub fn without_hostname_verification(mut self) -> Self {
        self.verify_hostname = false;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Credentials sent with AUTH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { username: String, password: String },
    Token(String),
}

impl Credentials {
    /// AUTH payload: `[username, password]` or the bare token.
    pub fn payload(&self) -> Value {
        match self {
            Credentials::Password { username, password } => json!([username, password]),
            Credentials::Token(token) => json!(token),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Timeout for establishing TCP and TLS.
    pub connect_timeout: Duration,
    /// Steady-state timeout for requests and socket I/O.
    pub io_timeout: Duration,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Credentials to authenticate with right after connecting.
    pub auth: Option<Credentials>,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(3),
            io_timeout: Duration::from_secs(15),
            nodelay: true,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            auth: None,
            tls: None,
        }
    }

    /// Parses `host[:port]`. Bracketed IPv6 literals are accepted.
    pub fn from_uri(uri: &str) -> Result<Self, ClientError> {
        let uri = uri.trim();
        let invalid = || ClientError::InvalidAddress(uri.to_string());

        let (host, port) = if let Some(rest) = uri.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid()),
            }
        } else {
            match uri.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (uri, None),
            }
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Credentials::Password {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(Credentials::Token(token.into()));
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.enabled)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    TlsUpgrading,
    Ready,
    Closed,
    Errored,
}

/// How long `listen()` may wait for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenTimeout {
    /// The connection's I/O timeout.
    #[default]
    Default,
    /// Wait until an event arrives or the connection closes.
    Never,
    After(Duration),
}

impl ListenTimeout {
    fn deadline(self, io_timeout: Duration) -> Option<Instant> {
        match self {
            ListenTimeout::Default => Some(Instant::now() + io_timeout),
            ListenTimeout::Never => None,
            ListenTimeout::After(d) => Some(Instant::now() + d),
        }
    }
}

impl From<Duration> for ListenTimeout {
    fn from(d: Duration) -> Self {
        ListenTimeout::After(d)
    }
}

/// Abandons its request on drop unless marked answered.
struct PendingRequest<'a> {
    correlator: &'a Mutex<Correlator>,
    id: u16,
    answered: bool,
}

impl PendingRequest<'_> {
    fn answered(mut self) {
        self.answered = true;
        self.correlator.lock().finish(self.id);
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if !self.answered {
            tracing::debug!("Request id={} abandoned", self.id);
            self.correlator.lock().abandon(self.id);
        }
    }
}

/// A connection to a ThingsDB node.
///
/// All reads go through one lock, so at most one task reads from the socket
/// at a time. Frames it reads for other callers are routed through the
/// correlator: to the waiting request, or onto the notification shelf.
pub struct Connection {
    config: ConnectionConfig,
    transport: Transport,
    correlator: Mutex<Correlator>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            transport: Transport::new(config.io_timeout),
            config,
            correlator: Mutex::new(Correlator::new()),
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        tracing::debug!("Connection state {:?} -> {:?}", *current, state);
        *current = state;
    }

    /// Connects to the server, upgrading to TLS and authenticating if configured.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.open().await {
            self.transport.close().await;
            self.set_state(ConnectionState::Errored);
            return Err(e);
        }

        if let Some(credentials) = self.config.auth.clone() {
            tracing::debug!("Authenticating with server...");
            self.authenticate(&credentials).await?;
            tracing::debug!("Authentication successful");
        }

        Ok(())
    }

    async fn open(&self) -> Result<(), ClientError> {
        let tcp = transport::dial(&self.config).await?;
        tracing::debug!("TCP connected");

        if self.config.tls_enabled() {
            self.set_state(ConnectionState::TlsUpgrading);
        }
        let stream = transport::upgrade(tcp, &self.config).await?;
        tracing::debug!(
            "Connected to {:?} (tls={})",
            stream.peer_addr().ok(),
            stream.is_tls()
        );

        self.transport
            .attach(stream, self.config.read_buffer_size)
            .await;
        self.correlator.lock().clear();
        self.set_state(ConnectionState::Ready);
        Ok(())
    }

    /// Sends AUTH and expects OK.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<(), ClientError> {
        let response = self
            .request(RequestType::Auth, Some(&credentials.payload()))
            .await?;
        expect_kind(response, ResponseType::Ok).map(|_| ())
    }

    fn ensure_ready(&self) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Closed | ConnectionState::Errored => {
                Err(ClientError::ConnectionClosed)
            }
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Marks the connection broken if `err` leaves the stream unusable.
    ///
    /// Readers queued behind the failing one then stop with `ConnectionClosed`.
    fn fail(&self, err: ClientError) -> ClientError {
        if err.is_connection_error() {
            {
                let mut state = self.state.lock();
                if *state == ConnectionState::Ready {
                    tracing::warn!("Connection lost: {}", err);
                    *state = ConnectionState::Errored;
                }
            }
            self.transport.mark_closed();
        }
        err
    }

    /// Sends a request and waits for its response using the I/O timeout.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        request_type: RequestType,
        payload: Option<&T>,
    ) -> Result<Response, ClientError> {
        self.request_with_timeout(request_type, payload, self.config.io_timeout)
            .await
    }

    /// Sends a request and waits up to `timeout` for the response carrying its ID.
    ///
    /// Frames read meanwhile that belong to someone else are routed, not lost.
    /// An ERROR response becomes [`ClientError::ServerError`].
    pub async fn request_with_timeout<T: Serialize + ?Sized>(
        &self,
        request_type: RequestType,
        payload: Option<&T>,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        self.ensure_ready()?;

        let pending = PendingRequest {
            correlator: &self.correlator,
            id: self.correlator.lock().begin(),
            answered: false,
        };
        let id = pending.id;

        let encoded = Encoder::encode_request(id, request_type, payload)?;
        tracing::debug!(
            "Sending request id={} type={:?} ({} bytes)",
            id,
            request_type,
            encoded.len()
        );
        self.transport
            .send(&encoded)
            .await
            .map_err(|e| self.fail(e))?;

        let deadline = Instant::now() + timeout;
        let frame = self.await_frame(id, deadline).await?;
        pending.answered();

        tracing::debug!("Request id={} got response", id);
        let response = Response::from_frame(&frame)?;
        if let Some(err) = response.error_payload()? {
            return Err(ClientError::ServerError {
                code: err.code(),
                message: err.error_msg,
            });
        }
        Ok(response)
    }

    async fn await_frame(&self, id: u16, deadline: Instant) -> Result<Frame, ClientError> {
        loop {
            let routed = self.correlator.lock().take(id);
            if let Some(frame) = routed {
                return Ok(frame);
            }

            let Some(mut reader) = self.transport.reader(Some(deadline)).await else {
                tracing::debug!("Request id={} timed out waiting for reader", id);
                return Err(ClientError::RequestTimeout { id });
            };
            // The previous reader may have failed the connection while we queued.
            self.ensure_ready()?;

            // Or it may have routed our frame.
            let routed = self.correlator.lock().take(id);
            if let Some(frame) = routed {
                return Ok(frame);
            }

            if !reader
                .readable(Some(deadline))
                .await
                .map_err(|e| self.fail(e))?
            {
                tracing::debug!("Request id={} timed out", id);
                return Err(ClientError::RequestTimeout { id });
            }

            let frame = reader.read_frame().await.map_err(|e| self.fail(e))?;
            if let Routed::Matched(frame) = self.route(frame, Some(id))? {
                return Ok(frame);
            }
        }
    }

    /// Routes a frame. A frame of unknown type fails the request it answers;
    /// any other one is logged and dropped.
    fn route(&self, frame: Frame, awaiting: Option<u16>) -> Result<Routed, ClientError> {
        match ResponseType::try_from(frame.frame_type) {
            Ok(kind) => Ok(self.correlator.lock().route(frame, kind, awaiting)),
            Err(e) if awaiting == Some(frame.id) => Err(e.into()),
            Err(e) => {
                tracing::warn!("Dropping frame id={}: {}", frame.id, e);
                Ok(Routed::Discarded)
            }
        }
    }

    /// Waits for a server push (or any other unclaimed frame).
    ///
    /// Shelved frames are returned first, oldest first. Otherwise one frame is
    /// read from the socket. `Ok(None)` means nothing arrived in time.
    pub async fn listen(&self, timeout: ListenTimeout) -> Result<Option<Response>, ClientError> {
        self.ensure_ready()?;
        let deadline = timeout.deadline(self.config.io_timeout);

        loop {
            let shelved = self.correlator.lock().pop_event();
            if let Some(frame) = shelved {
                return Ok(Some(Response::from_frame(&frame)?));
            }

            let Some(mut reader) = self.transport.reader(deadline).await else {
                return Ok(None);
            };
            self.ensure_ready()?;

            let shelved = self.correlator.lock().pop_event();
            if let Some(frame) = shelved {
                return Ok(Some(Response::from_frame(&frame)?));
            }

            if !reader.readable(deadline).await.map_err(|e| self.fail(e))? {
                return Ok(None);
            }

            // Frames answering pending requests go to their waiters; anything
            // else lands on the shelf and is popped on the next pass.
            let frame = reader.read_frame().await.map_err(|e| self.fail(e))?;
            self.route(frame, None)?;
        }
    }

    /// Returns the number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.correlator.lock().pending_count()
    }

    /// Returns the number of frames waiting to be consumed by `listen()`.
    pub fn shelved_count(&self) -> usize {
        self.correlator.lock().shelved_count()
    }

    /// Closes the connection. Closing twice, or before connecting, is a no-op.
    pub async fn close(&self) {
        tracing::debug!("Closing connection...");
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disconnected {
                *state = ConnectionState::Closed;
            }
        }

        self.transport.close().await;
        self.correlator.lock().clear();
        tracing::debug!("Connection closed");
    }
}

/// Checks that a solicited response has the expected type.
pub(crate) fn expect_kind(
    response: Response,
    expected: ResponseType,
) -> Result<Response, ClientError> {
    if response.kind == expected {
        Ok(response)
    } else {
        Err(ClientError::UnexpectedResponse {
            expected,
            actual: response.kind,
        })
    }
}
