//! Async Client
//!
//! A small request/reply client for the binary protocol, used by the CLI
//! binary and the integration tests.
//!
//! ## Example
//!
//! ```ignore
//! use blockkv::client::Client;
//!
//! let mut client = Client::connect("127.0.0.1:8100").await?;
//! client.auth("secret").await?;
//! client.set("users/ariz", "hello", 0).await?;
//! assert!(client.get("users/ariz").await?.is_some());
//! ```

use crate::protocol::{write_message, Message, MessageReader, Op, Status, StreamError};
use crate::storage::Slot;
use tokio::io::BufWriter;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Errors returned by [`Client`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// The server answered UNAUTHORIZED and closed the connection
    #[error("unauthorized")]
    Unauthorized,

    /// The server answered ERROR and closed the connection
    #[error("server reported an error")]
    Server,

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("connection closed by server")]
    Closed,
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

pub struct Client {
    reader: MessageReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> ClientResult<Self> {
        Self::connect_with_limit(addr, crate::DEFAULT_MAX_MESSAGE_SIZE).await
    }

    /// Connects, accepting replies up to `max_message_size` bytes.
    pub async fn connect_with_limit(
        addr: impl ToSocketAddrs,
        max_message_size: usize,
    ) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: MessageReader::new(read_half, max_message_size),
            writer: BufWriter::new(write_half),
        })
    }

    pub async fn auth(&mut self, secret: &str) -> ClientResult<()> {
        self.request(Message::auth(secret), Op::Auth).await.map(|_| ())
    }

    pub async fn ping(&mut self) -> ClientResult<()> {
        self.request(Message::ping(), Op::Pong).await.map(|_| ())
    }

    /// Fetches a slot; `None` if the server holds nothing under `key`.
    pub async fn get(&mut self, key: &str) -> ClientResult<Option<Slot>> {
        self.send(&Message::get(key)).await?;
        let reply = self.receive().await?;
        if reply.is_status(Status::NotFound) {
            return Ok(None);
        }

        let reply = expect(reply, Op::Get)?;
        Ok(Some(Slot {
            value: reply.value,
            expires: reply.expires,
            modified: reply.modified,
        }))
    }

    /// Stores a value and waits for the acknowledgement. `expires` is a unix
    /// timestamp in seconds, 0 for never.
    pub async fn set(&mut self, key: &str, value: impl Into<bytes::Bytes>, expires: u64) -> ClientResult<()> {
        self.request(Message::set(key, value, expires, true), Op::SetAck)
            .await
            .map(|_| ())
    }

    /// Stores a value without waiting for a reply.
    pub async fn set_nowait(&mut self, key: &str, value: impl Into<bytes::Bytes>, expires: u64) -> ClientResult<()> {
        self.send(&Message::set(key, value, expires, false)).await
    }

    pub async fn del(&mut self, key: &str) -> ClientResult<()> {
        self.request(Message::del(key, true), Op::DelAck).await.map(|_| ())
    }

    pub async fn del_nowait(&mut self, key: &str) -> ClientResult<()> {
        self.send(&Message::del(key, false)).await
    }

    /// Collects every key starting with `prefix`.
    pub async fn list(&mut self, prefix: &str) -> ClientResult<Vec<String>> {
        self.send(&Message::list(prefix)).await?;

        let mut keys = Vec::new();
        loop {
            let reply = self.receive().await?;
            if reply.is_status(Status::StreamEnd) {
                return Ok(keys);
            }
            keys.push(expect(reply, Op::List)?.key);
        }
    }

    pub async fn count(&mut self, prefix: &str) -> ClientResult<u64> {
        let reply = self.request(Message::count(prefix), Op::Count).await?;
        let raw: [u8; 8] = reply.value[..]
            .try_into()
            .map_err(|_| ClientError::UnexpectedReply(format!("count of {} bytes", reply.value.len())))?;
        Ok(u64::from_be_bytes(raw))
    }

    /// Asks the server to end the session.
    pub async fn close(mut self) -> ClientResult<()> {
        self.send(&Message::close()).await
    }

    async fn request(&mut self, msg: Message, expected: Op) -> ClientResult<Message> {
        self.send(&msg).await?;
        let reply = self.receive().await?;
        expect(reply, expected)
    }

    async fn send(&mut self, msg: &Message) -> ClientResult<()> {
        write_message(&mut self.writer, msg).await?;
        Ok(())
    }

    async fn receive(&mut self) -> ClientResult<Message> {
        let reply = self.reader.read_message().await?.ok_or(ClientError::Closed)?;
        match reply.status {
            Status::Unauthorized => Err(ClientError::Unauthorized),
            Status::Error => Err(ClientError::Server),
            _ => Ok(reply),
        }
    }
}

fn expect(reply: Message, op: Op) -> ClientResult<Message> {
    if reply.op == op && reply.status == Status::Ok {
        Ok(reply)
    } else {
        Err(ClientError::UnexpectedReply(reply.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandHandler;
    use crate::connection::{serve, ConnectionSettings, ConnectionStats};
    use crate::storage::Store;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    async fn start_server(secret: Option<&str>) -> (String, watch::Sender<bool>) {
        let store = Arc::new(Store::in_memory(4, Duration::from_secs(60)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let settings = Arc::new(ConnectionSettings {
            auth_secret: secret.map(String::from),
            ..ConnectionSettings::default()
        });
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve(
            listener,
            CommandHandler::new(store, 16),
            settings,
            Arc::new(ConnectionStats::new()),
            rx,
        ));
        (addr, tx)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (addr, _shutdown) = start_server(None).await;
        let mut client = Client::connect(&addr).await.unwrap();

        client.ping().await.unwrap();
        client.set("users/a", "1", 0).await.unwrap();
        client.set("users/b", "2", 4_000_000_000).await.unwrap();

        let slot = client.get("users/b").await.unwrap().unwrap();
        assert_eq!(&slot.value[..], b"2");
        assert_eq!(slot.expires, 4_000_000_000);

        assert_eq!(client.count("users/").await.unwrap(), 2);
        let mut keys = client.list("users/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["users/a", "users/b"]);

        // Deleted keys read back as tombstones until the sweeper runs.
        client.del("users/a").await.unwrap();
        let tombstone = client.get("users/a").await.unwrap().unwrap();
        assert!(tombstone.expires > 0);
        assert!(client.get("users/missing").await.unwrap().is_none());
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_nowait_writes_are_ordered() {
        let (addr, _shutdown) = start_server(None).await;
        let mut client = Client::connect(&addr).await.unwrap();

        client.set_nowait("k", "v1", 0).await.unwrap();
        client.set_nowait("k", "v2", 0).await.unwrap();
        let slot = client.get("k").await.unwrap().unwrap();
        assert_eq!(&slot.value[..], b"v2");

        client.del_nowait("k").await.unwrap();
        assert!(client.get("k").await.unwrap().unwrap().expires > 0);
    }

    #[tokio::test]
    async fn test_auth_required() {
        let (addr, _shutdown) = start_server(Some("pw")).await;

        let mut client = Client::connect(&addr).await.unwrap();
        assert!(matches!(client.get("k").await, Err(ClientError::Unauthorized)));

        let mut client = Client::connect(&addr).await.unwrap();
        client.ping().await.unwrap();
        client.auth("pw").await.unwrap();
        client.set("k", "v", 0).await.unwrap();
        assert!(client.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrong_secret() {
        let (addr, _shutdown) = start_server(Some("pw")).await;
        let mut client = Client::connect(&addr).await.unwrap();
        assert!(matches!(client.auth("nope").await, Err(ClientError::Unauthorized)));
    }
}
