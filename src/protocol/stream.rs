//! Message Streams
//!
//! Reading and writing whole messages over any async byte stream. Client
//! connections, the client library and both ends of replication share
//! these helpers.
//!
//! ## Read backoff
//!
//! Timeouts and transient I/O errors are retried after a delay that starts
//! at 10ms and doubles. Once the next delay would exceed 100ms the read
//! gives up with [`StreamError::Exhausted`]. Any successful read resets it.
//!
//! ```text
//!  read ─ timeout ─▶ sleep 10ms ─ timeout ─▶ sleep 20ms ─ ... ─▶ sleep 80ms ─ timeout ─▶ Exhausted
//!    ▲                                 │
//!    └────────── bytes arrive ─────────┘ (reset)
//! ```

use crate::protocol::codec::{encode_into, EncodeError};
use crate::protocol::parser::{FrameParser, ParseError};
use crate::protocol::types::Message;
use bytes::BytesMut;
use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Errors from reading or writing messages.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Transient read failures outlasted the backoff ceiling
    #[error("read retries exhausted")]
    Exhausted,

    /// The peer closed the stream in the middle of a frame
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

impl StreamError {
    /// True when the peer is gone and no reply can be delivered.
    pub fn is_disconnect(&self) -> bool {
        match self {
            StreamError::UnexpectedEof => true,
            StreamError::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Exponential backoff for transient read failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_millis(100))
    }
}

impl Backoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            initial,
            ceiling,
            next: initial,
        }
    }

    /// Delay before the next attempt, or `None` once past the ceiling.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.next > self.ceiling {
            return None;
        }
        let delay = self.next;
        self.next = self.next.saturating_mul(2);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// Reads whole messages from a byte stream.
///
/// `read_message` is cancel safe: bytes already read stay buffered, so it
/// can be used as a `tokio::select!` branch.
#[derive(Debug)]
pub struct MessageReader<R> {
    reader: R,
    buffer: BytesMut,
    parser: FrameParser,
    read_timeout: Option<Duration>,
    backoff: Backoff,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R, max_frame: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: FrameParser::new(max_frame),
            read_timeout: None,
            backoff: Backoff::default(),
            bytes_read: 0,
        }
    }

    /// Counts reads that take longer than `timeout` as transient failures.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Total bytes read from the underlying stream.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Reads the next message. Returns `Ok(None)` on a clean end of stream.
    pub async fn read_message(&mut self) -> Result<Option<Message>, StreamError> {
        loop {
            if let Some(msg) = self.parser.parse(&mut self.buffer)? {
                return Ok(Some(msg));
            }

            match self.fill().await {
                Ok(0) => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    return Err(StreamError::UnexpectedEof);
                }
                Ok(n) => {
                    self.backoff.reset();
                    self.bytes_read += n as u64;
                    trace!(bytes = n, buffered = self.buffer.len(), "Read data");
                }
                Err(e) if is_transient(&e) => match self.backoff.next_delay() {
                    Some(delay) => {
                        trace!(delay_ms = delay.as_millis() as u64, error = %e, "Read backoff");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        self.backoff.reset();
                        return Err(StreamError::Exhausted);
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn fill(&mut self) -> std::io::Result<usize> {
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let read = self.reader.read_buf(&mut self.buffer);
        match self.read_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, read).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(ErrorKind::TimedOut, "read timed out")),
            },
            None => read.await,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes `msg` as one frame and flushes. Returns the bytes written.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<usize, StreamError> {
    let mut buf = BytesMut::new();
    encode_into(msg, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    trace!(bytes = buf.len(), op = %msg.op, status = %msg.status, "Sent message");
    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode;
    use crate::protocol::types::{Op, Status};
    use tokio_test::io::Builder;

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::default();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80),
            ]
        );

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_read_messages_across_chunks() {
        let a = encode(&Message::get("a")).unwrap();
        let b = encode(&Message::set("b", "v", 0, true)).unwrap();
        let mut joined = a.to_vec();
        joined.extend_from_slice(&b);
        let (first, second) = joined.split_at(5);

        let mock = Builder::new().read(first).read(second).build();
        let mut reader = MessageReader::new(mock, 1024);

        assert_eq!(reader.read_message().await.unwrap().unwrap().key, "a");
        assert_eq!(reader.read_message().await.unwrap().unwrap().op, Op::SetAck);
        assert!(reader.read_message().await.unwrap().is_none());
        assert_eq!(reader.bytes_read(), joined.len() as u64);
    }

    #[tokio::test]
    async fn test_transient_errors_back_off_then_recover() {
        let frame = encode(&Message::ping()).unwrap();
        let mock = Builder::new()
            .read_error(std::io::Error::new(ErrorKind::TimedOut, "slow"))
            .read_error(std::io::Error::new(ErrorKind::TimedOut, "slow"))
            .read(&frame)
            .build();
        let mut reader = MessageReader::new(mock, 1024);

        assert_eq!(reader.read_message().await.unwrap().unwrap().op, Op::Ping);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust() {
        let mut builder = Builder::new();
        for _ in 0..5 {
            builder.read_error(std::io::Error::new(ErrorKind::TimedOut, "slow"));
        }
        let mock = builder.build();
        drop(builder);
        let mut reader = MessageReader::new(mock, 1024);

        assert!(matches!(
            reader.read_message().await,
            Err(StreamError::Exhausted)
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_frame() {
        let mock = Builder::new().read(b"\x20\x00partial").build();
        let mut reader = MessageReader::new(mock, 1024);
        let err = reader.read_message().await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_write_message() {
        let msg = Message::status(Status::NotFound);
        let frame = encode(&msg).unwrap();
        let mut mock = Builder::new().write(&frame).build();

        let written = write_message(&mut mock, &msg).await.unwrap();
        assert_eq!(written, frame.len());
    }

    #[tokio::test]
    async fn test_write_rejects_marker() {
        let mut sink = Vec::new();
        let err = write_message(&mut sink, &Message::get("x+ENDy")).await.unwrap_err();
        assert!(matches!(err, StreamError::Encode(EncodeError::MarkerInBody)));
        assert!(sink.is_empty());
    }
}
