//! Socket ownership and byte transfer.
//!
//! Writes and reads go through separate locks so a request can be written
//! while another task is blocked waiting for data. Only one task at a time
//! may hold the read side; that task reads whole frames.

use crate::connection::ConnectionConfig;
use crate::error::ClientError;
use crate::stream::ClientStream;
use crate::tls::{create_insecure_tls_connector, create_tls_connector};
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use thingsdb_protocol::Frame;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::{timeout, timeout_at, Instant};

/// Opens a TCP connection bounded by the connect timeout.
pub async fn dial(config: &ConnectionConfig) -> Result<TcpStream, ClientError> {
    tracing::debug!("Connecting to {}:{}...", config.host, config.port);

    let stream = timeout(
        config.connect_timeout,
        TcpStream::connect((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| {
        tracing::debug!("Connection timeout");
        ClientError::Timeout
    })?
    .map_err(|e| {
        tracing::debug!("Connection failed: {}", e);
        ClientError::Io(e)
    })?;

    stream.set_nodelay(config.nodelay)?;
    Ok(stream)
}

/// Runs the TLS handshake over an established TCP stream.
pub async fn upgrade(
    stream: TcpStream,
    config: &ConnectionConfig,
) -> Result<ClientStream, ClientError> {
    let tls = match config.tls {
        Some(ref tls) if tls.enabled => tls,
        _ => return Ok(ClientStream::from(stream)),
    };

    let (connector, server_name) = if tls.verify_peer {
        create_tls_connector(tls, &config.host)?
    } else {
        tracing::warn!("Using insecure TLS (certificate verification disabled)");
        create_insecure_tls_connector(tls, &config.host)?
    };

    tracing::debug!("Performing TLS handshake...");
    let tls_stream = timeout(config.connect_timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| ClientError::TlsHandshake("handshake timed out".into()))?
        .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
    tracing::debug!("TLS handshake complete");

    Ok(ClientStream::from(tls_stream))
}

/// Read half of the socket plus the bytes read from it but not yet framed.
///
/// Bytes stay here when a reader gives up mid-frame, so the next reader
/// resumes at the same position in the stream.
struct Reader {
    half: ReadHalf<ClientStream>,
    buf: BytesMut,
    chunk: usize,
}

/// Owner of the socket halves.
pub struct Transport {
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<WriteHalf<ClientStream>>>,
    io_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl Transport {
    /// Creates a transport with no socket attached.
    pub fn new(io_timeout: Duration) -> Self {
        let (closed, _) = watch::channel(true);
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            io_timeout,
            closed,
        }
    }

    /// Takes ownership of an established stream.
    pub async fn attach(&self, stream: ClientStream, read_buffer_size: usize) {
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(Reader {
            half: read_half,
            buf: BytesMut::with_capacity(read_buffer_size),
            chunk: read_buffer_size,
        });
        self.closed.send_replace(false);
    }

    /// Writes all of `bytes`, retrying partial writes.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::NotConnected)?;

        timeout(self.io_timeout, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??;
        Ok(())
    }

    /// Acquires the read side, waiting no later than `deadline`.
    ///
    /// Returns `None` if the deadline passed while another task was reading.
    pub async fn reader(&self, deadline: Option<Instant>) -> Option<ReadGuard<'_>> {
        let inner = match deadline {
            Some(deadline) => timeout_at(deadline, self.reader.lock()).await.ok()?,
            None => self.reader.lock().await,
        };
        Some(ReadGuard {
            inner,
            io_timeout: self.io_timeout,
            closed: self.closed.subscribe(),
        })
    }

    /// Stops every current and future reader with `ConnectionClosed`.
    ///
    /// The socket itself is released by `close()`.
    pub fn mark_closed(&self) {
        self.closed.send_replace(true);
    }

    /// Shuts the socket down. Safe to call any number of times.
    pub async fn close(&self) {
        self.mark_closed();

        if let Some(mut writer) = self.writer.lock().await.take() {
            tracing::debug!("Shutting down writer");
            let _ = writer.shutdown().await;
        }
        let _ = self.reader.lock().await.take();
    }
}

/// Reads whatever the socket has into the frame buffer.
///
/// Cancel-safe: a read either completes into `buf` or takes nothing.
async fn fill(reader: &mut Reader, closed: &mut watch::Receiver<bool>) -> Result<(), ClientError> {
    reader.buf.reserve(reader.chunk);
    tokio::select! {
        biased;
        _ = closed.wait_for(|closed| *closed) => Err(ClientError::ConnectionClosed),
        res = reader.half.read_buf(&mut reader.buf) => match res? {
            0 => {
                tracing::debug!("Connection closed (0 bytes)");
                Err(ClientError::ConnectionClosed)
            }
            _ => Ok(()),
        },
    }
}

/// Exclusive access to the read side of the socket.
pub struct ReadGuard<'a> {
    inner: MutexGuard<'a, Option<Reader>>,
    io_timeout: Duration,
    closed: watch::Receiver<bool>,
}

impl ReadGuard<'_> {
    /// Waits until at least one byte is buffered or can be read.
    ///
    /// Returns `Ok(false)` when `deadline` passes first. Whatever was read
    /// stays buffered, so giving up here leaves the stream frame-aligned.
    pub async fn readable(&mut self, deadline: Option<Instant>) -> Result<bool, ClientError> {
        let reader = self.inner.as_mut().ok_or(ClientError::NotConnected)?;
        if *self.closed.borrow() {
            return Err(ClientError::ConnectionClosed);
        }
        if !reader.buf.is_empty() {
            return Ok(true);
        }

        let wait = fill(reader, &mut self.closed);
        match deadline {
            Some(deadline) => match timeout_at(deadline, wait).await {
                Ok(res) => res.map(|()| true),
                Err(_) => Ok(false),
            },
            None => wait.await.map(|()| true),
        }
    }

    /// Reads one whole frame: header, then payload when its length is non-zero.
    ///
    /// Once a frame has started the rest must arrive within the I/O timeout;
    /// otherwise the stream is considered broken. Dropping this future keeps
    /// the partial frame buffered for the next reader.
    pub async fn read_frame(&mut self) -> Result<Frame, ClientError> {
        let io_timeout = self.io_timeout;
        let reader = self.inner.as_mut().ok_or(ClientError::NotConnected)?;
        if *self.closed.borrow() {
            return Err(ClientError::ConnectionClosed);
        }
        let closed = &mut self.closed;

        let read = async move {
            loop {
                if let Some(frame) = Frame::decode(&mut reader.buf)? {
                    tracing::debug!(
                        "Read frame id={} type={} ({} bytes)",
                        frame.id,
                        frame.frame_type,
                        frame.payload.len()
                    );
                    return Ok::<_, ClientError>(frame);
                }
                fill(reader, closed).await?;
            }
        };

        timeout(io_timeout, read).await.map_err(|_| {
            ClientError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "incomplete frame before I/O timeout",
            ))
        })?
    }
}
