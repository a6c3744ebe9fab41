//! Connection Handler Module
//!
//! This module handles individual client connections. Each client gets its
//! own handler task that runs in a loop, reading requests and sending
//! replies.
//!
//! ## Session states
//!
//! ```text
//!                      AUTH (right secret) ──▶ OK
//!   ┌─────────────────┐ ─────────────────────────────▶ ┌───────────────┐
//!   │ Unauthenticated │                                │ Authenticated │
//!   └─────────────────┘                                └───────────────┘
//!     │  PING ──▶ PONG                                   all requests
//!     │  AUTH (wrong secret) ──▶ UNAUTHORIZED, close
//!     └─ anything privileged ──▶ UNAUTHORIZED, close
//! ```
//!
//! Without a configured secret the session starts authenticated.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │  read frame ─▶ gate ─▶ execute ─▶ reply   (loop)
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. CLOSE / error / client disconnect
//!        │
//!        ▼
//! 5. Handler task ends
//! ```
//!
//! Decode errors, exhausted read retries and non-request ops are answered
//! with a best-effort ERROR status before the socket is closed.

use crate::commands::{list_item, CommandHandler, Reply};
use crate::config::Config;
use crate::protocol::{encode_into, Message, MessageReader, Op, Status, StreamError};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total requests processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: u64) {
        self.bytes_read.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Per-connection settings shared by every session of a listener.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Shared secret; `None` disables authentication
    pub auth_secret: Option<String>,
    /// Largest accepted frame
    pub max_message_size: usize,
    /// Optional per-read timeout
    pub read_timeout: Option<Duration>,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            auth_secret: config.auth_secret.clone(),
            max_message_size: config.max_message_size,
            read_timeout: config.read_timeout,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Authentication state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    Unauthenticated,
    Authenticated,
}

/// Outcome of checking a request against the session state.
#[derive(Debug, PartialEq)]
pub enum Gate {
    /// Hand the request to the command handler
    Pass,
    /// Answer directly and keep going
    Reply(Message),
    /// Answer UNAUTHORIZED and close
    Reject,
}

impl Session {
    pub fn initial(secret: Option<&str>) -> Self {
        match secret {
            Some(_) => Session::Unauthenticated,
            None => Session::Authenticated,
        }
    }

    /// Applies the authentication rules to one request.
    ///
    /// The secret is compared as a plain string.
    pub fn gate(&mut self, secret: Option<&str>, msg: &Message) -> Gate {
        if *self == Session::Authenticated {
            return Gate::Pass;
        }

        match msg.op {
            Op::Auth if secret == Some(msg.key.as_str()) => {
                *self = Session::Authenticated;
                Gate::Reply(Message::ok(Op::Auth))
            }
            Op::Auth => Gate::Reject,
            op if op.is_privileged() => Gate::Reject,
            _ => Gate::Pass,
        }
    }
}

/// Handles a single client connection.
///
/// This struct manages the read buffer, parsing, and reply sending
/// for one connected client.
pub struct ConnectionHandler<S> {
    reader: MessageReader<ReadHalf<S>>,

    writer: BufWriter<WriteHalf<S>>,

    /// Client's address (for logging)
    addr: SocketAddr,

    session: Session,

    /// The command handler (shared across connections)
    command_handler: CommandHandler,

    settings: Arc<ConnectionSettings>,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl<S: AsyncRead + AsyncWrite> ConnectionHandler<S> {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The byte stream for this connection
    /// * `addr` - The client's socket address
    /// * `command_handler` - The command handler for executing requests
    /// * `settings` - Authentication and framing settings
    /// * `stats` - Shared connection statistics
    pub fn new(
        stream: S,
        addr: SocketAddr,
        command_handler: CommandHandler,
        settings: Arc<ConnectionSettings>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = MessageReader::new(read_half, settings.max_message_size)
            .with_read_timeout(settings.read_timeout);

        Self {
            reader,
            writer: BufWriter::new(write_half),
            addr,
            session: Session::initial(settings.auth_secret.as_deref()),
            command_handler,
            settings,
            stats,
        }
    }

    pub fn session(&self) -> Session {
        self.session
    }

    /// Runs the main connection loop.
    ///
    /// This method reads requests from the client, executes them,
    /// and sends back replies until the client disconnects or an error occurs.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "Client disconnected")
            }
            Err(e) if e.is_disconnect() => {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        let _ = self.writer.shutdown().await;
        self.stats.connection_closed();
        result
    }

    /// The main read-gate-execute-reply loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = self.next_message().await?;
            self.stats.command_processed();
            trace!(client = %self.addr, op = %msg.op, "Request");

            match self.session.gate(self.settings.auth_secret.as_deref(), &msg) {
                Gate::Pass => {}
                Gate::Reply(reply) => {
                    debug!(client = %self.addr, "Client authenticated");
                    self.send(&reply).await?;
                    continue;
                }
                Gate::Reject => {
                    warn!(client = %self.addr, op = %msg.op, "Unauthorized request");
                    self.send(&Message::status(Status::Unauthorized)).await?;
                    return Err(ConnectionError::Unauthorized);
                }
            }

            match self.command_handler.execute(msg).await {
                Reply::Message(reply) => self.send(&reply).await?,
                Reply::None => {}
                Reply::Keys(rx) => self.stream_keys(rx).await?,
                Reply::Close => return Ok(()),
                Reply::Error(reason) => {
                    self.send_error().await;
                    return Err(ConnectionError::Protocol(reason));
                }
            }
        }
    }

    /// Reads the next request, answering fatal read failures with ERROR.
    async fn next_message(&mut self) -> Result<Message, ConnectionError> {
        let before = self.reader.bytes_read();
        let result = self.reader.read_message().await;
        self.stats.bytes_read(self.reader.bytes_read() - before);

        match result {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(ConnectionError::ClientDisconnected),
            Err(e) if e.is_disconnect() => Err(e.into()),
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Read failed");
                self.send_error().await;
                Err(e.into())
            }
        }
    }

    /// Sends one LIST message per key, then STREAM_END.
    async fn stream_keys(&mut self, mut rx: mpsc::Receiver<String>) -> Result<(), ConnectionError> {
        let mut sent = 0u64;
        while let Some(key) = rx.recv().await {
            self.queue(&list_item(key)).await?;
            sent += 1;
        }
        self.send(&Message::status(Status::StreamEnd)).await?;
        trace!(client = %self.addr, keys = sent, "List streamed");
        Ok(())
    }

    /// Writes a reply without flushing.
    async fn queue(&mut self, msg: &Message) -> Result<(), ConnectionError> {
        let mut buf = BytesMut::new();
        encode_into(msg, &mut buf).map_err(StreamError::from)?;
        self.writer.write_all(&buf).await?;
        self.stats.bytes_written(buf.len());
        Ok(())
    }

    /// Writes a reply and flushes.
    async fn send(&mut self, msg: &Message) -> Result<(), ConnectionError> {
        self.queue(msg).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Sends an ERROR status, ignoring failures.
    async fn send_error(&mut self) {
        if let Err(e) = self.send(&Message::status(Status::Error)).await {
            trace!(client = %self.addr, error = %e, "Could not deliver ERROR status");
        }
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Reading or framing a message failed
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Missing or wrong secret
    #[error("Unauthorized")]
    Unauthorized,

    /// The client sent something that is not a request
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ConnectionError {
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::ClientDisconnected => true,
            ConnectionError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
            ),
            ConnectionError::Stream(e) => e.is_disconnect(),
            _ => false,
        }
    }
}

/// Handles a client connection.
///
/// This is a convenience function that creates a ConnectionHandler
/// and runs it to completion.
pub async fn handle_connection<S: AsyncRead + AsyncWrite>(
    stream: S,
    addr: SocketAddr,
    command_handler: CommandHandler,
    settings: Arc<ConnectionSettings>,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, settings, stats);
    if let Err(e) = handler.run().await {
        if !e.is_disconnect() {
            debug!(client = %addr, error = %e, "Connection ended with error");
        }
    }
}

/// Accepts client connections until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    command_handler: CommandHandler,
    settings: Arc<ConnectionSettings>,
    stats: Arc<ConnectionStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted: std::io::Result<(TcpStream, SocketAddr)> = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => return,
        };

        match accepted {
            Ok((stream, addr)) => {
                let handler = command_handler.clone();
                let settings = Arc::clone(&settings);
                let stats = Arc::clone(&stats);

                tokio::spawn(async move {
                    handle_connection(stream, addr, handler, settings, stats).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
