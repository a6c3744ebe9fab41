//! Replication Messages
//!
//! Replication reuses the client frame format. The handshake and resync
//! framing travel as SYNC messages; ops travel as SET and DEL messages.
//!
//! ```text
//! hello      SYNC / NONE   value = replica_id(16) primary_id(16, zero = none) head(u64 BE)
//! directive  SYNC / OK     value = primary_id(16) head(u64 BE) resync(1)
//! op         SET|DEL / OK  value = offset(u64 BE) slot value
//!                          expires, modified in the header
//! resync end SYNC / STREAM_END
//! ```

use crate::protocol::{Message, Op, Status};
use crate::replication::ReplicationError;
use crate::storage::id::ID_LEN;
use crate::storage::{Id, Mutation, MutationKind, Slot};
use bytes::{BufMut, Bytes, BytesMut};

const OFFSET_LEN: usize = 8;

/// A single replicated mutation as it travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplOp {
    /// Position in the primary's op stream; 0 for resync replays
    pub offset: u64,
    pub kind: MutationKind,
    pub key: String,
    pub slot: Slot,
}

impl ReplOp {
    pub fn new(offset: u64, mutation: &Mutation) -> Self {
        Self {
            offset,
            kind: mutation.kind,
            key: mutation.key.clone(),
            slot: mutation.slot.clone(),
        }
    }

    /// A replay of a stored slot.
    pub fn replay(key: String, slot: Slot) -> Self {
        Self {
            offset: 0,
            kind: MutationKind::Set,
            key,
            slot,
        }
    }

    pub fn to_message(&self) -> Message {
        let op = match self.kind {
            MutationKind::Set => Op::Set,
            MutationKind::Delete => Op::Del,
        };

        let mut value = BytesMut::with_capacity(OFFSET_LEN + self.slot.value.len());
        value.put_u64(self.offset);
        if self.kind == MutationKind::Set {
            value.put_slice(&self.slot.value);
        }

        Message::ok(op)
            .with_key(self.key.clone())
            .with_value(value.freeze())
            .with_expires(self.slot.expires)
            .with_modified(self.slot.modified)
    }

    pub fn from_message(msg: &Message) -> Result<Self, ReplicationError> {
        let kind = match msg.op {
            Op::Set => MutationKind::Set,
            Op::Del => MutationKind::Delete,
            other => return Err(ReplicationError::Malformed(format!("{} is not an op", other))),
        };
        if msg.value.len() < OFFSET_LEN {
            return Err(ReplicationError::Malformed("op without offset".into()));
        }

        Ok(Self {
            offset: read_u64(&msg.value[..OFFSET_LEN]),
            kind,
            key: msg.key.clone(),
            slot: Slot {
                value: msg.value.slice(OFFSET_LEN..),
                expires: msg.expires,
                modified: msg.modified,
            },
        })
    }
}

/// What a replica presents after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub replica_id: Id,
    /// Primary the replica last followed
    pub primary_id: Option<Id>,
    /// Offset of the last op the replica applied
    pub head: u64,
}

impl Hello {
    const LEN: usize = ID_LEN * 2 + OFFSET_LEN;

    pub fn to_message(&self) -> Message {
        let mut value = BytesMut::with_capacity(Self::LEN);
        value.put_slice(self.replica_id.as_bytes());
        match &self.primary_id {
            Some(id) => value.put_slice(id.as_bytes()),
            None => value.put_bytes(0, ID_LEN),
        }
        value.put_u64(self.head);
        Message::new(Op::Sync).with_value(value.freeze())
    }

    pub fn from_message(msg: &Message) -> Result<Self, ReplicationError> {
        if msg.op != Op::Sync || msg.value.len() != Self::LEN {
            return Err(ReplicationError::Malformed(format!("expected hello, got {}", msg)));
        }

        let v = &msg.value;
        let replica_id = id_at(v, 0)?;
        let primary_id = id_at(v, ID_LEN)?;
        Ok(Self {
            replica_id,
            primary_id: (primary_id.as_bytes() != &[0u8; ID_LEN]).then_some(primary_id),
            head: read_u64(&v[ID_LEN * 2..]),
        })
    }
}

/// How a replica must catch up before streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resync {
    /// Buffered ops cover everything after the replica's head
    None = 0,
    /// Some ops were lost; the affected blocks are replayed
    Partial = 1,
    /// Every block is replayed
    Full = 2,
}

impl Resync {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Resync::None),
            1 => Some(Resync::Partial),
            2 => Some(Resync::Full),
            _ => None,
        }
    }
}

/// The primary's answer to a hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive {
    pub primary_id: Id,
    /// Offset the replica is at once a full resync is applied
    pub head: u64,
    pub resync: Resync,
}

impl Directive {
    const LEN: usize = ID_LEN + OFFSET_LEN + 1;

    pub fn to_message(&self) -> Message {
        let mut value = BytesMut::with_capacity(Self::LEN);
        value.put_slice(self.primary_id.as_bytes());
        value.put_u64(self.head);
        value.put_u8(self.resync as u8);
        Message::ok(Op::Sync).with_value(value.freeze())
    }

    pub fn from_message(msg: &Message) -> Result<Self, ReplicationError> {
        if msg.status == Status::Unauthorized {
            return Err(ReplicationError::Unauthorized);
        }
        if msg.op != Op::Sync || msg.status != Status::Ok || msg.value.len() != Self::LEN {
            return Err(ReplicationError::Malformed(format!("expected directive, got {}", msg)));
        }

        let v = &msg.value;
        let resync = Resync::from_byte(v[ID_LEN + OFFSET_LEN])
            .ok_or_else(|| ReplicationError::Malformed("unknown resync mode".into()))?;
        Ok(Self {
            primary_id: id_at(v, 0)?,
            head: read_u64(&v[ID_LEN..ID_LEN + OFFSET_LEN]),
            resync,
        })
    }
}

/// The message closing a resync.
pub fn resync_end() -> Message {
    Message::new(Op::Sync).with_status(Status::StreamEnd)
}

pub fn is_resync_end(msg: &Message) -> bool {
    msg.op == Op::Sync && msg.status == Status::StreamEnd
}

fn id_at(bytes: &Bytes, at: usize) -> Result<Id, ReplicationError> {
    bytes
        .get(at..at + ID_LEN)
        .and_then(Id::from_slice)
        .ok_or_else(|| ReplicationError::Malformed("truncated identifier".into()))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_message_layout() {
        let op = ReplOp {
            offset: 7,
            kind: MutationKind::Set,
            key: "k".into(),
            slot: Slot {
                value: Bytes::from("v"),
                expires: 10,
                modified: 20,
            },
        };
        let msg = op.to_message();
        assert_eq!(msg.op, Op::Set);
        assert_eq!(msg.status, Status::Ok);
        assert_eq!(&msg.value[..8], &7u64.to_be_bytes());
        assert_eq!(&msg.value[8..], b"v");
        assert_eq!(msg.expires, 10);
        assert_eq!(msg.modified, 20);

        assert_eq!(ReplOp::from_message(&msg).unwrap(), op);
    }

    #[test]
    fn test_delete_op_drops_value() {
        let op = ReplOp {
            offset: 3,
            kind: MutationKind::Delete,
            key: "k".into(),
            slot: Slot {
                value: Bytes::from("old value"),
                expires: 100,
                modified: 40,
            },
        };
        let decoded = ReplOp::from_message(&op.to_message()).unwrap();
        assert_eq!(decoded.kind, MutationKind::Delete);
        assert!(decoded.slot.value.is_empty());
        assert_eq!(decoded.slot.expires, 100);
    }

    #[test]
    fn test_op_without_offset() {
        let msg = Message::ok(Op::Set).with_key("k").with_value("short");
        assert!(matches!(
            ReplOp::from_message(&msg),
            Err(ReplicationError::Malformed(_))
        ));
    }

    #[test]
    fn test_hello_without_primary() {
        let hello = Hello {
            replica_id: Id::random(),
            primary_id: None,
            head: 0,
        };
        let msg = hello.to_message();
        assert_eq!(&msg.value[ID_LEN..ID_LEN * 2], &[0u8; ID_LEN]);
        assert_eq!(Hello::from_message(&msg).unwrap(), hello);
    }

    #[test]
    fn test_hello_with_primary() {
        let hello = Hello {
            replica_id: Id::random(),
            primary_id: Some(Id::random()),
            head: 99,
        };
        assert_eq!(Hello::from_message(&hello.to_message()).unwrap(), hello);
    }

    #[test]
    fn test_directive() {
        let directive = Directive {
            primary_id: Id::random(),
            head: 1234,
            resync: Resync::Partial,
        };
        let msg = directive.to_message();
        assert_eq!(msg.value.len(), 25);
        assert_eq!(msg.value[24], 1);
        assert_eq!(Directive::from_message(&msg).unwrap(), directive);
    }

    #[test]
    fn test_directive_unauthorized() {
        let msg = Message::status(Status::Unauthorized);
        assert!(matches!(
            Directive::from_message(&msg),
            Err(ReplicationError::Unauthorized)
        ));
    }

    #[test]
    fn test_resync_end() {
        assert!(is_resync_end(&resync_end()));
        assert!(!is_resync_end(&Message::status(Status::StreamEnd)));
    }
}
