//! Request Dispatch
//!
//! Turns an authenticated request into store calls and a [`Reply`].
//!
//! ## Requests
//!
//! | op       | store call              | reply                             |
//! |----------|-------------------------|-----------------------------------|
//! | PING     |                         | PONG / OK                         |
//! | AUTH     |                         | OK (already authenticated)        |
//! | GET      | `get`                   | GET / OK with slot, or NOT_FOUND  |
//! | SET      | `set`                   | none                              |
//! | SET-ACK  | `set`                   | SET-ACK / OK                      |
//! | DEL      | `delete`                | none                              |
//! | DEL-ACK  | `delete`                | DEL-ACK / OK                      |
//! | LIST     | `list`                  | LIST / OK per key, then STREAM_END|
//! | COUNT    | `count`                 | COUNT / OK, value = u64 BE        |
//! | CLOSE    |                         | none, session ends                |
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  Message ───> execute() ───> Store ───> Reply               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::protocol::{Message, Op, Status};
use crate::storage::{Origin, Slot, Store};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// What the connection should do after a request.
#[derive(Debug)]
pub enum Reply {
    /// Send a single message
    Message(Message),
    /// Send nothing
    None,
    /// Send one LIST message per key, then a STREAM_END status
    Keys(mpsc::Receiver<String>),
    /// End the session without replying
    Close,
    /// Send an ERROR status, then end the session
    Error(String),
}

/// Executes requests against the store.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    store: Arc<Store>,
    /// Channel capacity for LIST streams
    list_buffer: usize,
}

impl CommandHandler {
    pub fn new(store: Arc<Store>, list_buffer: usize) -> Self {
        Self { store, list_buffer }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Executes one request from an authenticated session.
    pub async fn execute(&self, msg: Message) -> Reply {
        trace!(op = %msg.op, key = %msg.key, "Executing request");

        match msg.op {
            Op::Ping => Reply::Message(Message::pong()),
            Op::Auth => Reply::Message(Message::ok(Op::Auth)),
            Op::Close => Reply::Close,
            Op::Get => self.get(msg),
            Op::Set | Op::SetAck => self.set(msg),
            Op::Del | Op::DelAck => self.del(msg),
            Op::List => Reply::Keys(self.store.list(&msg.key, self.list_buffer)),
            Op::Count => self.count(msg).await,
            Op::Noop | Op::Pong | Op::Sync => {
                Reply::Error(format!("{} is not a request", msg.op))
            }
        }
    }

    fn get(&self, msg: Message) -> Reply {
        match self.store.get(&msg.key) {
            Some(slot) => Reply::Message(
                Message::ok(Op::Get)
                    .with_key(msg.key)
                    .with_value(slot.value)
                    .with_expires(slot.expires)
                    .with_modified(slot.modified),
            ),
            None => Reply::Message(Message::status(Status::NotFound)),
        }
    }

    fn set(&self, msg: Message) -> Reply {
        let ack = msg.op == Op::SetAck;
        let slot = Slot::with_expiry(msg.value, msg.expires);
        self.store.set(msg.key, slot, Origin::Local);

        if ack {
            Reply::Message(Message::ok(Op::SetAck))
        } else {
            Reply::None
        }
    }

    fn del(&self, msg: Message) -> Reply {
        self.store.delete(&msg.key);

        if msg.op == Op::DelAck {
            Reply::Message(Message::ok(Op::DelAck))
        } else {
            Reply::None
        }
    }

    async fn count(&self, msg: Message) -> Reply {
        let count = self.store.count(&msg.key).await;
        Reply::Message(
            Message::ok(Op::Count)
                .with_key(msg.key)
                .with_value(count.to_be_bytes().to_vec()),
        )
    }
}

/// Message carrying one key of a LIST stream.
pub fn list_item(key: String) -> Message {
    Message::ok(Op::List).with_key(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn create_handler() -> CommandHandler {
        let store = Arc::new(Store::in_memory(2, Duration::from_secs(60)));
        CommandHandler::new(store, 16)
    }

    fn expect_message(reply: Reply) -> Message {
        match reply {
            Reply::Message(msg) => msg,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let handler = create_handler();
        let reply = expect_message(handler.execute(Message::ping()).await);
        assert_eq!(reply.op, Op::Pong);
        assert_eq!(reply.status, Status::Ok);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let handler = create_handler();
        assert!(matches!(
            handler.execute(Message::set("a/b", "v", 0, false)).await,
            Reply::None
        ));

        let reply = expect_message(handler.execute(Message::get("a/b")).await);
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.key, "a/b");
        assert_eq!(reply.value, Bytes::from("v"));
        assert!(reply.modified > 0);
    }

    #[tokio::test]
    async fn test_set_ack_and_expiry() {
        let handler = create_handler();
        let reply = expect_message(handler.execute(Message::set("k", "v", 4_000_000_000, true)).await);
        assert_eq!(reply.op, Op::SetAck);
        assert_eq!(reply.status, Status::Ok);

        let reply = expect_message(handler.execute(Message::get("k")).await);
        assert_eq!(reply.expires, 4_000_000_000);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let handler = create_handler();
        let reply = expect_message(handler.execute(Message::get("nope")).await);
        assert_eq!(reply.status, Status::NotFound);
    }

    #[tokio::test]
    async fn test_del_ack() {
        let handler = create_handler();
        handler.execute(Message::set("k", "v", 0, false)).await;
        assert!(matches!(handler.execute(Message::del("k", false)).await, Reply::None));

        let reply = expect_message(handler.execute(Message::del("k", true)).await);
        assert_eq!(reply.op, Op::DelAck);
        assert_eq!(reply.status, Status::Ok);
    }

    #[tokio::test]
    async fn test_count() {
        let handler = create_handler();
        for i in 0..5 {
            handler.execute(Message::set(format!("n/{}", i), "v", 0, false)).await;
        }
        let reply = expect_message(handler.execute(Message::count("n/")).await);
        assert_eq!(&reply.value[..], &5u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_list() {
        let handler = create_handler();
        handler.execute(Message::set("x1", "v", 0, false)).await;
        handler.execute(Message::set("x2", "v", 0, false)).await;
        handler.execute(Message::set("y1", "v", 0, false)).await;

        let Reply::Keys(mut rx) = handler.execute(Message::list("x")).await else {
            panic!("expected a key stream");
        };
        let mut keys = Vec::new();
        while let Some(key) = rx.recv().await {
            keys.push(key);
        }
        keys.sort();
        assert_eq!(keys, vec!["x1", "x2"]);
    }

    #[tokio::test]
    async fn test_non_requests_are_errors() {
        let handler = create_handler();
        for op in [Op::Pong, Op::Noop, Op::Sync] {
            assert!(matches!(handler.execute(Message::new(op)).await, Reply::Error(_)));
        }
        assert!(matches!(handler.execute(Message::close()).await, Reply::Close));
    }
}
