//! Wire Protocol Data Types
//!
//! Every exchange on a connection is a [`Message`]: an op code, a status
//! byte, two timestamps, a UTF-8 key and an opaque value.
//!
//! ## Op codes
//!
//! | byte | op       | byte | op       |
//! |------|----------|------|----------|
//! | 0x00 | NOOP     | 0x31 | SET-ACK  |
//! | 0x01 | CLOSE    | 0x40 | DEL      |
//! | 0x02 | AUTH     | 0x41 | DEL-ACK  |
//! | 0x10 | PING     | 0x50 | LIST     |
//! | 0x11 | PONG     | 0x60 | COUNT    |
//! | 0x20 | GET      | 0x70 | SYNC     |
//! | 0x30 | SET      |      |          |
//!
//! ## Status bytes
//!
//! Requests carry `0x00`. Replies use `_` OK, `!` ERROR, `#` UNAUTHORIZED,
//! `.` NOT_FOUND and `/` STREAM_END.

use bytes::Bytes;
use std::fmt;

/// Operation carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Status-only replies
    Noop = 0x00,
    Close = 0x01,
    Auth = 0x02,
    Ping = 0x10,
    Pong = 0x11,
    Get = 0x20,
    Set = 0x30,
    SetAck = 0x31,
    Del = 0x40,
    DelAck = 0x41,
    List = 0x50,
    Count = 0x60,
    /// Replication handshake and resync framing
    Sync = 0x70,
}

impl Op {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => Op::Noop,
            0x01 => Op::Close,
            0x02 => Op::Auth,
            0x10 => Op::Ping,
            0x11 => Op::Pong,
            0x20 => Op::Get,
            0x30 => Op::Set,
            0x31 => Op::SetAck,
            0x40 => Op::Del,
            0x41 => Op::DelAck,
            0x50 => Op::List,
            0x60 => Op::Count,
            0x70 => Op::Sync,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// True for ops a client may send on a client connection.
    pub fn is_request(self) -> bool {
        !matches!(self, Op::Noop | Op::Pong | Op::Sync)
    }

    /// True for ops that require an authenticated session.
    pub fn is_privileged(self) -> bool {
        !matches!(self, Op::Ping | Op::Auth | Op::Close)
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Noop => "NOOP",
            Op::Close => "CLOSE",
            Op::Auth => "AUTH",
            Op::Ping => "PING",
            Op::Pong => "PONG",
            Op::Get => "GET",
            Op::Set => "SET",
            Op::SetAck => "SET-ACK",
            Op::Del => "DEL",
            Op::DelAck => "DEL-ACK",
            Op::List => "LIST",
            Op::Count => "COUNT",
            Op::Sync => "SYNC",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome carried by a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Requests
    None = 0x00,
    Ok = b'_',
    Error = b'!',
    Unauthorized = b'#',
    NotFound = b'.',
    StreamEnd = b'/',
}

impl Status {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => Status::None,
            b'_' => Status::Ok,
            b'!' => Status::Error,
            b'#' => Status::Unauthorized,
            b'.' => Status::NotFound,
            b'/' => Status::StreamEnd,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::None => "NONE",
            Status::Ok => "OK",
            Status::Error => "ERROR",
            Status::Unauthorized => "UNAUTHORIZED",
            Status::NotFound => "NOT_FOUND",
            Status::StreamEnd => "STREAM_END",
        };
        f.write_str(name)
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub op: Op,
    pub status: Status,
    /// Unix seconds, 0 = never
    pub expires: u64,
    /// Unix seconds
    pub modified: u64,
    pub key: String,
    pub value: Bytes,
}

impl Message {
    /// A request with no key, value or timestamps.
    pub fn new(op: Op) -> Self {
        Self {
            op,
            status: Status::None,
            expires: 0,
            modified: 0,
            key: String::new(),
            value: Bytes::new(),
        }
    }

    /// A status-only reply.
    pub fn status(status: Status) -> Self {
        Self::new(Op::Noop).with_status(status)
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_expires(mut self, expires: u64) -> Self {
        self.expires = expires;
        self
    }

    pub fn with_modified(mut self, modified: u64) -> Self {
        self.modified = modified;
        self
    }

    // ========================================================================
    // Requests
    // ========================================================================

    pub fn auth(secret: impl Into<String>) -> Self {
        Self::new(Op::Auth).with_key(secret)
    }

    pub fn ping() -> Self {
        Self::new(Op::Ping)
    }

    pub fn close() -> Self {
        Self::new(Op::Close)
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(Op::Get).with_key(key)
    }

    /// SET, or SET-ACK when `ack` is true.
    pub fn set(key: impl Into<String>, value: impl Into<Bytes>, expires: u64, ack: bool) -> Self {
        let op = if ack { Op::SetAck } else { Op::Set };
        Self::new(op)
            .with_key(key)
            .with_value(value)
            .with_expires(expires)
    }

    /// DEL, or DEL-ACK when `ack` is true.
    pub fn del(key: impl Into<String>, ack: bool) -> Self {
        let op = if ack { Op::DelAck } else { Op::Del };
        Self::new(op).with_key(key)
    }

    pub fn list(prefix: impl Into<String>) -> Self {
        Self::new(Op::List).with_key(prefix)
    }

    pub fn count(prefix: impl Into<String>) -> Self {
        Self::new(Op::Count).with_key(prefix)
    }

    // ========================================================================
    // Replies
    // ========================================================================

    pub fn pong() -> Self {
        Self::new(Op::Pong).with_status(Status::Ok)
    }

    /// OK reply to `op`.
    pub fn ok(op: Op) -> Self {
        Self::new(op).with_status(Status::Ok)
    }

    pub fn is_status(&self, status: Status) -> bool {
        self.status == status
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.status)?;
        if !self.key.is_empty() {
            write!(f, " key={:?}", self.key)?;
        }
        if !self.value.is_empty() {
            write!(f, " value=({} bytes)", self.value.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_bytes() {
        for op in [
            Op::Noop,
            Op::Close,
            Op::Auth,
            Op::Ping,
            Op::Pong,
            Op::Get,
            Op::Set,
            Op::SetAck,
            Op::Del,
            Op::DelAck,
            Op::List,
            Op::Count,
            Op::Sync,
        ] {
            assert_eq!(Op::from_byte(op.as_byte()), Some(op));
        }
        assert_eq!(Op::Count.as_byte(), 0x60);
        assert_eq!(Op::from_byte(0x99), None);
    }

    #[test]
    fn test_status_bytes() {
        assert_eq!(Status::Ok.as_byte(), b'_');
        assert_eq!(Status::Error.as_byte(), b'!');
        assert_eq!(Status::Unauthorized.as_byte(), b'#');
        assert_eq!(Status::NotFound.as_byte(), b'.');
        assert_eq!(Status::StreamEnd.as_byte(), b'/');
        assert_eq!(Status::from_byte(b'?'), None);
    }

    #[test]
    fn test_privileged_ops() {
        assert!(!Op::Ping.is_privileged());
        assert!(!Op::Auth.is_privileged());
        assert!(Op::Get.is_privileged());
        assert!(Op::List.is_privileged());
        assert!(!Op::Pong.is_request());
        assert!(!Op::Sync.is_request());
    }

    #[test]
    fn test_builders() {
        let msg = Message::set("k", "v", 42, true);
        assert_eq!(msg.op, Op::SetAck);
        assert_eq!(msg.status, Status::None);
        assert_eq!(msg.expires, 42);
        assert_eq!(msg.value, Bytes::from("v"));

        let reply = Message::status(Status::NotFound);
        assert_eq!(reply.op, Op::Noop);
        assert!(reply.is_status(Status::NotFound));
    }

    #[test]
    fn test_display() {
        assert_eq!(Message::get("name").to_string(), "GET NONE key=\"name\"");
        assert_eq!(Message::pong().to_string(), "PONG OK");
    }
}
