//! Primary to Replica Replication
//!
//! A primary streams every local mutation to its replicas over a dedicated
//! listener that speaks the regular frame format.
//!
//! ## Modules
//!
//! - `op`: Handshake messages and the op wire form
//! - `ring`: Bounded op history per registration
//! - `primary`: Fan-out, registrations, resync and streaming
//! - `replica`: Following a primary and persisting the stream position
//!
//! ## Guarantees
//!
//! Ops for one key reach a replica in the order the primary applied them.
//! Replicated writes keep the primary's timestamps and are applied last
//! write wins, so a replayed block never rolls a newer op back. A replica
//! that fell too far behind is caught up by replaying whole blocks.

pub mod op;
pub mod primary;
pub mod replica;
pub mod ring;

pub use op::{Directive, Hello, ReplOp, Resync};
pub use primary::{Broadcaster, Primary, MAX_SEND_FAILURES};
pub use replica::{Replica, ReplicaState, StateSaver, DEFAULT_SAVE_INTERVAL, STATE_FILE};
pub use ring::OpRing;

use crate::error::StoreError;
use crate::protocol::{EncodeError, StreamError};

/// Errors that end a replication session.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("malformed replication message: {0}")]
    Malformed(String),

    /// Missing or wrong secret
    #[error("unauthorized")]
    Unauthorized,

    #[error("stream abandoned after {failures} consecutive send failures")]
    Abandoned { failures: usize },

    /// The store already feeds another mutation sink
    #[error("store already has a mutation sink")]
    SinkTaken,
}
