//! Primary Side
//!
//! The primary numbers every local mutation with a stream offset and fans it
//! out to one registration per known replica.
//!
//! ## Architecture
//!
//! ```text
//!   Block::set / delete (block locked)
//!          │
//!          ▼
//!   ┌─────────────┐  offset = head + 1
//!   │ Broadcaster │──────────────┬──────────────────┐
//!   └─────────────┘              ▼                  ▼
//!                         input (unbounded)   input (unbounded)
//!                                │                  │
//!                           roll task          roll task
//!                                │                  │
//!                                ▼                  ▼
//!                          ┌──────────┐       ┌──────────┐
//!                          │  OpRing  │       │  OpRing  │   evictions feed
//!                          │  outbox  │       │  outbox  │   tail + lagging
//!                          └────┬─────┘       └────┬─────┘
//!                               ▼                  ▼
//!                          replica session    replica session
//! ```
//!
//! ## Handshake
//!
//! 1. The replica authenticates (if a secret is configured) and sends a hello
//!    with its id, the primary it last followed and its head offset.
//! 2. Without a registration under this primary's id a new one is created
//!    and every block is replayed (full resync).
//! 3. A known replica whose head is behind the newest op lost from its ring
//!    gets the affected blocks replayed (partial resync).
//! 4. The resync ends with a SYNC / STREAM_END message, then buffered ops
//!    newer than the replica's head stream as they arrive.
//!
//! Registrations outlive their sessions so that a reconnecting replica can
//! resume. A registration whose ring loses an unsent op while no session is
//! attached is dropped; its replica gets a full resync next time.

use super::op::{resync_end, Directive, Hello, ReplOp, Resync};
use super::ring::OpRing;
use super::ReplicationError;
use crate::connection::{ConnectionSettings, Gate, Session};
use crate::protocol::{encode_into, Message, MessageReader, Op, Status};
use crate::storage::{Id, Mutation, MutationSink, Store};
use bytes::BytesMut;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, trace, warn};

/// Consecutive send failures after which a stream is abandoned.
pub const MAX_SEND_FAILURES: usize = 5;

/// Ops sent between flushes.
const BATCH_SIZE: usize = 256;

/// An op waiting in a registration's ring.
#[derive(Debug, Clone)]
pub struct Queued {
    pub op: ReplOp,
    pub block: u64,
    /// Block version after the op was applied
    pub version: u64,
}

// ============================================================================
// Fan-out
// ============================================================================

/// The store's mutation sink: assigns offsets and feeds every registration.
#[derive(Debug, Default)]
pub struct Broadcaster {
    head: AtomicU64,
    inputs: Mutex<HashMap<Id, mpsc::UnboundedSender<Queued>>>,
}

impl Broadcaster {
    /// Offset of the newest op.
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Adds an input; every op after the returned head is delivered to it.
    fn subscribe(&self, id: Id, input: mpsc::UnboundedSender<Queued>) -> u64 {
        let mut inputs = self.inputs.lock();
        inputs.insert(id, input);
        self.head.load(Ordering::Acquire)
    }

    fn unsubscribe(&self, id: &Id) {
        self.inputs.lock().remove(id);
    }
}

impl MutationSink for Broadcaster {
    fn record(&self, mutation: Mutation) {
        // Offsets are assigned under the inputs lock so every input sees
        // them in increasing order.
        let inputs = self.inputs.lock();
        let offset = self.head.fetch_add(1, Ordering::AcqRel) + 1;
        if inputs.is_empty() {
            return;
        }

        let queued = Queued {
            op: ReplOp::new(offset, &mutation),
            block: mutation.block,
            version: mutation.version,
        };
        for input in inputs.values() {
            let _ = input.send(queued.clone());
        }
    }
}

// ============================================================================
// Registrations
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Evicted {
    offset: u64,
    version: u64,
}

/// Ring plus the bookkeeping of what the replica may have missed.
#[derive(Debug)]
struct Outbox {
    ring: OpRing<Queued>,
    /// Offset of the newest op evicted or lost
    tail: u64,
    /// Offset of the newest op handed to the current session
    cursor: u64,
    /// Per block, the newest op evicted from the ring
    evicted: HashMap<u64, Evicted>,
    /// Blocks that must be replayed, with the newest lost version
    lagging: HashMap<u64, u64>,
    /// Per block, the version covered by the last replay
    watermarks: HashMap<u64, u64>,
    /// Generation of the session that owns the outbox
    session: u64,
}

impl Outbox {
    fn new(capacity: usize, cursor: u64) -> Self {
        Self {
            ring: OpRing::new(capacity),
            tail: 0,
            cursor,
            evicted: HashMap::new(),
            lagging: HashMap::new(),
            watermarks: HashMap::new(),
            session: 0,
        }
    }

    /// Buffers an op. Returns true if an op that was never sent got evicted.
    fn push(&mut self, queued: Queued) -> bool {
        let Some(old) = self.ring.push(queued) else {
            return false;
        };

        self.tail = self.tail.max(old.op.offset);
        let evicted = self.evicted.entry(old.block).or_default();
        evicted.offset = evicted.offset.max(old.op.offset);
        evicted.version = evicted.version.max(old.version);

        if old.op.offset > self.cursor {
            self.mark_lagging(old.block, old.version);
            true
        } else {
            false
        }
    }

    /// Records an op that could not be delivered.
    fn lost(&mut self, queued: &Queued) {
        self.tail = self.tail.max(queued.op.offset);
        self.mark_lagging(queued.block, queued.version);
    }

    fn mark_lagging(&mut self, block: u64, version: u64) {
        let lagging = self.lagging.entry(block).or_insert(0);
        *lagging = (*lagging).max(version);
    }

    /// Prepares for a reconnecting replica that has applied everything up to `head`.
    fn resume(&mut self, head: u64) -> Resync {
        self.session += 1;
        self.cursor = head;
        self.watermarks.clear();

        let missed: Vec<(u64, u64)> = self
            .evicted
            .iter()
            .filter(|(_, e)| e.offset > head)
            .map(|(block, e)| (*block, e.version))
            .collect();
        for (block, version) in missed {
            self.mark_lagging(block, version);
        }

        if head < self.tail {
            Resync::Partial
        } else {
            Resync::None
        }
    }

    /// Takes the next ops to send, skipping what a replay covers.
    fn next_batch(&mut self, max: usize) -> Vec<Queued> {
        let cursor = self.cursor;
        let mut index = self.ring.partition_point(|q| q.op.offset <= cursor);
        let mut batch = Vec::new();

        while batch.len() < max {
            let Some(queued) = self.ring.get(index) else {
                break;
            };
            index += 1;
            self.cursor = queued.op.offset;

            if self.lagging.contains_key(&queued.block) {
                continue;
            }
            if self
                .watermarks
                .get(&queued.block)
                .is_some_and(|w| queued.version <= *w)
            {
                continue;
            }
            batch.push(queued.clone());
        }

        batch
    }

    fn lagging_blocks(&self) -> Vec<u64> {
        let mut blocks: Vec<u64> = self.lagging.keys().copied().collect();
        blocks.sort_unstable();
        blocks
    }

    /// Records that `block` was replayed up to `version`.
    fn replayed(&mut self, block: u64, version: u64) {
        self.watermarks.insert(block, version);
        if self.lagging.get(&block).is_some_and(|v| *v <= version) {
            self.lagging.remove(&block);
        }
        if self.evicted.get(&block).is_some_and(|e| e.version <= version) {
            self.evicted.remove(&block);
        }
    }
}

#[derive(Debug)]
struct Registration {
    id: Id,
    outbox: Mutex<Outbox>,
    notify: Notify,
    attached: AtomicBool,
    closed: AtomicBool,
}

impl Registration {
    fn new(id: Id, capacity: usize, head: u64) -> Self {
        Self {
            id,
            outbox: Mutex::new(Outbox::new(capacity, head)),
            notify: Notify::new(),
            attached: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Locks the outbox for `session`, or returns `None` once a newer session took over.
    fn outbox_for(&self, session: u64) -> Option<MutexGuard<'_, Outbox>> {
        let outbox = self.outbox.lock();
        (outbox.session == session).then_some(outbox)
    }

    fn is_current(&self, session: u64) -> bool {
        self.outbox.lock().session == session
    }

    /// Clears `attached` unless a newer session owns the registration.
    fn detach(&self, session: u64) {
        let outbox = self.outbox.lock();
        if outbox.session == session {
            self.attached.store(false, Ordering::Release);
        }
    }
}

/// Moves ops from a registration's input into its ring.
async fn roll(
    primary: Weak<Primary>,
    registration: Arc<Registration>,
    mut input: mpsc::UnboundedReceiver<Queued>,
) {
    while let Some(queued) = input.recv().await {
        let lost = registration.outbox.lock().push(queued);

        if lost && !registration.attached.load(Ordering::Acquire) {
            let Some(primary) = primary.upgrade() else {
                return;
            };
            if primary.drop_if_detached(&registration) {
                warn!(replica = %registration.id, "Op buffer overflowed while detached, registration dropped");
                return;
            }
        }

        registration.notify.notify_one();
    }

    trace!(replica = %registration.id, "Registration input closed");
}

// ============================================================================
// Primary
// ============================================================================

/// The primary end of replication.
#[derive(Debug)]
pub struct Primary {
    id: Id,
    store: Arc<Store>,
    broadcaster: Arc<Broadcaster>,
    registrations: Mutex<HashMap<Id, Arc<Registration>>>,
    buffer_size: usize,
}

impl Primary {
    /// Creates a primary with a fresh id and installs it as the store's sink.
    pub fn start(store: Arc<Store>, buffer_size: usize) -> Result<Arc<Self>, ReplicationError> {
        let broadcaster = Arc::new(Broadcaster::default());
        if !store.attach_sink(broadcaster.clone()) {
            return Err(ReplicationError::SinkTaken);
        }

        let primary = Arc::new(Self {
            id: Id::random(),
            store,
            broadcaster,
            registrations: Mutex::new(HashMap::new()),
            buffer_size,
        });
        info!(primary = %primary.id, buffer_size, "Replication primary started");
        Ok(primary)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Offset of the newest op.
    pub fn head(&self) -> u64 {
        self.broadcaster.head()
    }

    /// Number of replicas with a registration.
    pub fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn is_attached(&self, replica: &Id) -> bool {
        self.registrations
            .lock()
            .get(replica)
            .is_some_and(|r| r.attached.load(Ordering::Acquire))
    }

    /// Binds a session to a registration and decides how the replica catches up.
    ///
    /// A hello for a replica that still has a session attached takes the
    /// registration over; the older session stops at its next wakeup.
    fn attach(self: &Arc<Self>, hello: &Hello) -> (Arc<Registration>, u64, Directive) {
        let mut registrations = self.registrations.lock();

        if hello.primary_id == Some(self.id) {
            if let Some(registration) = registrations.get(&hello.replica_id) {
                let mut outbox = registration.outbox.lock();
                if registration.attached.swap(true, Ordering::AcqRel) {
                    warn!(replica = %hello.replica_id, "Replica reconnected over a live session, taking over");
                }
                let resync = outbox.resume(hello.head);
                let session = outbox.session;
                drop(outbox);
                registration.notify.notify_waiters();

                let directive = Directive {
                    primary_id: self.id,
                    head: self.broadcaster.head(),
                    resync,
                };
                return (Arc::clone(registration), session, directive);
            }
        }

        if let Some(stale) = registrations.remove(&hello.replica_id) {
            self.broadcaster.unsubscribe(&stale.id);
            stale.close();
        }

        let (input, rx) = mpsc::unbounded_channel();
        let head = self.broadcaster.subscribe(hello.replica_id, input);
        let registration = Arc::new(Registration::new(hello.replica_id, self.buffer_size, head));
        let session = registration.outbox.lock().session;
        registrations.insert(hello.replica_id, Arc::clone(&registration));
        tokio::spawn(roll(Arc::downgrade(self), Arc::clone(&registration), rx));

        let directive = Directive {
            primary_id: self.id,
            head,
            resync: Resync::Full,
        };
        (registration, session, directive)
    }

    /// Removes `registration` unless a session attached in the meantime.
    fn drop_if_detached(&self, registration: &Arc<Registration>) -> bool {
        let mut registrations = self.registrations.lock();
        match registrations.get(&registration.id) {
            Some(current)
                if Arc::ptr_eq(current, registration)
                    && !current.attached.load(Ordering::Acquire) => {}
            _ => return false,
        }

        registrations.remove(&registration.id);
        self.broadcaster.unsubscribe(&registration.id);
        registration.close();
        true
    }

    /// Accepts replica connections until `shutdown` flips to true.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        settings: Arc<ConnectionSettings>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted: std::io::Result<(TcpStream, SocketAddr)> = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => return,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let primary = Arc::clone(&self);
                    let settings = Arc::clone(&settings);

                    tokio::spawn(async move {
                        if let Err(e) = primary.handle_replica(stream, addr, settings).await {
                            warn!(replica_addr = %addr, error = %e, "Replica session ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept replica connection: {}", e);
                }
            }
        }
    }

    /// Runs one replica session to completion.
    pub async fn handle_replica<S>(
        self: Arc<Self>,
        stream: S,
        addr: SocketAddr,
        settings: Arc<ConnectionSettings>,
    ) -> Result<(), ReplicationError>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = MessageReader::new(read_half, settings.max_message_size);
        let mut link = Link::new(write_half);

        let Some(hello) = handshake(&mut reader, &mut link, &settings).await? else {
            debug!(replica_addr = %addr, "Replica left before hello");
            return Ok(());
        };

        let (registration, session, directive) = self.attach(&hello);
        info!(
            replica = %hello.replica_id,
            replica_addr = %addr,
            resync = ?directive.resync,
            head = directive.head,
            "Replica attached"
        );

        let result = self
            .stream_to(&registration, session, directive, &mut reader, &mut link)
            .await;

        registration.detach(session);
        let _ = link.writer.shutdown().await;
        info!(replica = %hello.replica_id, "Replica detached");
        result
    }

    async fn stream_to<R, W>(
        &self,
        registration: &Registration,
        session: u64,
        directive: Directive,
        reader: &mut MessageReader<R>,
        link: &mut Link<W>,
    ) -> Result<(), ReplicationError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        link.send(&directive.to_message()).await?;

        match directive.resync {
            Resync::Full => {
                let blocks: Vec<u64> = self.store.blocks().map(|b| b.number()).collect();
                for number in blocks {
                    self.replay(registration, session, number, link).await?;
                }
            }
            Resync::Partial => self.replay_lagging(registration, session, link).await?,
            Resync::None => {}
        }
        link.send(&resync_end()).await?;

        loop {
            if registration.is_closed() {
                debug!(replica = %registration.id, "Registration replaced");
                return Ok(());
            }
            if !registration.is_current(session) {
                debug!(replica = %registration.id, "Session taken over by a newer connection");
                // Pass on a wakeup this session may have consumed.
                registration.notify.notify_one();
                return Ok(());
            }

            self.replay_lagging(registration, session, link).await?;

            let Some(batch) = registration
                .outbox_for(session)
                .map(|mut outbox| outbox.next_batch(BATCH_SIZE))
            else {
                continue;
            };
            if batch.is_empty() {
                tokio::select! {
                    _ = registration.notify.notified() => continue,
                    msg = reader.read_message() => match msg? {
                        None => return Ok(()),
                        Some(msg) if msg.op == Op::Close => return Ok(()),
                        Some(msg) if msg.op == Op::Ping => {
                            link.send(&Message::pong()).await?;
                            continue;
                        }
                        Some(msg) => {
                            return Err(ReplicationError::Malformed(format!(
                                "unexpected {} from replica",
                                msg.op
                            )))
                        }
                    },
                }
            }

            for queued in &batch {
                if !link.push(&queued.op.to_message()).await? {
                    if let Some(mut outbox) = registration.outbox_for(session) {
                        outbox.lost(queued);
                    }
                }
            }
            link.flush().await?;
            trace!(replica = %registration.id, ops = batch.len(), "Ops streamed");
        }
    }

    async fn replay_lagging<W: AsyncWrite + Unpin>(
        &self,
        registration: &Registration,
        session: u64,
        link: &mut Link<W>,
    ) -> Result<(), ReplicationError> {
        let blocks = registration.outbox.lock().lagging_blocks();
        for number in blocks {
            self.replay(registration, session, number, link).await?;
        }
        Ok(())
    }

    /// Sends every slot of a block as an offset-less SET.
    ///
    /// A block with a slot that could not be sent stays lagging and is
    /// replayed again later.
    async fn replay<W: AsyncWrite + Unpin>(
        &self,
        registration: &Registration,
        session: u64,
        number: u64,
        link: &mut Link<W>,
    ) -> Result<(), ReplicationError> {
        let Some(block) = self.store.block(number) else {
            if let Some(mut outbox) = registration.outbox_for(session) {
                outbox.replayed(number, u64::MAX);
            }
            return Ok(());
        };

        let (slots, version) = block.snapshot();
        let keys = slots.len();
        let mut failed = 0usize;
        for (key, slot) in slots {
            if !link.push(&ReplOp::replay(key, slot).to_message()).await? {
                failed += 1;
            }
        }
        link.flush().await?;

        let Some(mut outbox) = registration.outbox_for(session) else {
            return Ok(());
        };
        if failed > 0 {
            outbox.mark_lagging(number, version);
            drop(outbox);
            warn!(replica = %registration.id, block = number, failed, "Block replay incomplete, left lagging");
            return Ok(());
        }
        outbox.replayed(number, version);
        drop(outbox);
        debug!(replica = %registration.id, block = number, keys, version, "Block replayed");
        Ok(())
    }
}

/// Reads up to the hello, applying the authentication gate.
async fn handshake<R, W>(
    reader: &mut MessageReader<R>,
    link: &mut Link<W>,
    settings: &ConnectionSettings,
) -> Result<Option<Hello>, ReplicationError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let secret = settings.auth_secret.as_deref();
    let mut session = Session::initial(secret);

    loop {
        let Some(msg) = reader.read_message().await? else {
            return Ok(None);
        };

        match session.gate(secret, &msg) {
            Gate::Reply(reply) => link.send(&reply).await?,
            Gate::Reject => {
                let _ = link.send(&Message::status(Status::Unauthorized)).await;
                return Err(ReplicationError::Unauthorized);
            }
            Gate::Pass => match msg.op {
                Op::Sync => return Hello::from_message(&msg).map(Some),
                Op::Ping => link.send(&Message::pong()).await?,
                Op::Auth => link.send(&Message::ok(Op::Auth)).await?,
                Op::Close => return Ok(None),
                other => {
                    let _ = link.send(&Message::status(Status::Error)).await;
                    return Err(ReplicationError::Malformed(format!(
                        "unexpected {} before hello",
                        other
                    )));
                }
            },
        }
    }
}

/// Write side of a replica session.
struct Link<W> {
    writer: BufWriter<W>,
    buf: BytesMut,
    failures: usize,
}

impl<W: AsyncWrite + Unpin> Link<W> {
    fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            buf: BytesMut::new(),
            failures: 0,
        }
    }

    async fn queue(&mut self, msg: &Message) -> Result<(), ReplicationError> {
        self.buf.clear();
        encode_into(msg, &mut self.buf)?;
        self.writer.write_all(&self.buf).await?;
        Ok(())
    }

    /// Queues a message, tolerating up to [`MAX_SEND_FAILURES`] consecutive failures.
    ///
    /// Returns false when this message could not be sent.
    async fn push(&mut self, msg: &Message) -> Result<bool, ReplicationError> {
        match self.queue(msg).await {
            Ok(()) => {
                self.failures = 0;
                Ok(true)
            }
            Err(e) => {
                self.failures += 1;
                warn!(key = %msg.key, error = %e, failures = self.failures, "Replication send failed");
                if self.failures >= MAX_SEND_FAILURES {
                    Err(ReplicationError::Abandoned {
                        failures: self.failures,
                    })
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), ReplicationError> {
        self.writer.flush().await?;
        Ok(())
    }

    async fn send(&mut self, msg: &Message) -> Result<(), ReplicationError> {
        self.queue(msg).await?;
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MutationKind, Origin, Slot};
    use bytes::Bytes;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    fn queued(offset: u64, block: u64, version: u64) -> Queued {
        Queued {
            op: ReplOp {
                offset,
                kind: MutationKind::Set,
                key: format!("k{}", offset),
                slot: Slot::new("v"),
            },
            block,
            version,
        }
    }

    fn offsets(batch: &[Queued]) -> Vec<u64> {
        batch.iter().map(|q| q.op.offset).collect()
    }

    #[test]
    fn test_broadcaster_numbers_ops() {
        let broadcaster = Broadcaster::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(broadcaster.subscribe(Id::random(), tx), 0);

        for version in 1..=3 {
            broadcaster.record(Mutation {
                kind: MutationKind::Set,
                key: "k".into(),
                slot: Slot::new("v"),
                block: 9,
                version,
            });
        }

        assert_eq!(broadcaster.head(), 3);
        for expected in 1..=3 {
            let q = rx.try_recv().unwrap();
            assert_eq!(q.op.offset, expected);
            assert_eq!(q.block, 9);
        }
    }

    #[test]
    fn test_batch_follows_cursor() {
        let mut outbox = Outbox::new(10, 2);
        for offset in 1..=5 {
            outbox.push(queued(offset, 1, offset));
        }
        assert_eq!(offsets(&outbox.next_batch(2)), vec![3, 4]);
        assert_eq!(offsets(&outbox.next_batch(10)), vec![5]);
        assert!(outbox.next_batch(10).is_empty());
    }

    #[test]
    fn test_unsent_eviction_marks_lagging() {
        let mut outbox = Outbox::new(2, 0);
        assert!(!outbox.push(queued(1, 7, 1)));
        assert!(!outbox.push(queued(2, 8, 1)));
        assert!(outbox.push(queued(3, 8, 2)));

        assert_eq!(outbox.tail, 1);
        assert_eq!(outbox.lagging_blocks(), vec![7]);
    }

    #[test]
    fn test_sent_eviction_is_not_lagging() {
        let mut outbox = Outbox::new(2, 0);
        outbox.push(queued(1, 7, 1));
        outbox.push(queued(2, 7, 2));
        assert_eq!(outbox.next_batch(10).len(), 2);

        assert!(!outbox.push(queued(3, 7, 3)));
        assert!(outbox.lagging_blocks().is_empty());
        assert_eq!(outbox.tail, 1);
    }

    #[test]
    fn test_lagging_blocks_are_skipped_until_replayed() {
        let mut outbox = Outbox::new(10, 0);
        outbox.push(queued(1, 1, 1));
        outbox.push(queued(2, 2, 1));
        outbox.lost(&queued(1, 1, 1));

        assert_eq!(offsets(&outbox.next_batch(10)), vec![2]);

        outbox.replayed(1, 1);
        assert!(outbox.lagging_blocks().is_empty());
    }

    #[test]
    fn test_watermark_skips_covered_ops() {
        let mut outbox = Outbox::new(10, 0);
        outbox.replayed(4, 2);
        outbox.push(queued(1, 4, 1));
        outbox.push(queued(2, 4, 2));
        outbox.push(queued(3, 4, 3));
        assert_eq!(offsets(&outbox.next_batch(10)), vec![3]);
    }

    #[test]
    fn test_replay_keeps_newer_loss() {
        let mut outbox = Outbox::new(10, 0);
        outbox.lost(&queued(5, 3, 9));
        outbox.replayed(3, 8);
        assert_eq!(outbox.lagging_blocks(), vec![3]);
        outbox.replayed(3, 9);
        assert!(outbox.lagging_blocks().is_empty());
    }

    #[test]
    fn test_resume_decides_resync() {
        let mut outbox = Outbox::new(2, 0);
        for offset in 1..=4 {
            outbox.push(queued(offset, offset, 1));
        }
        outbox.next_batch(10);
        outbox.replayed(1, 1);
        outbox.replayed(2, 1);

        // Everything after the tail is still buffered.
        assert_eq!(outbox.resume(2), Resync::None);
        assert_eq!(offsets(&outbox.next_batch(10)), vec![3, 4]);

        outbox.push(queued(5, 5, 1));
        outbox.push(queued(6, 6, 1));
        assert_eq!(outbox.tail, 4);

        // Op 4 was streamed but the replica never applied it.
        assert_eq!(outbox.resume(3), Resync::Partial);
        assert_eq!(outbox.lagging_blocks(), vec![4]);
        assert_eq!(offsets(&outbox.next_batch(10)), vec![5, 6]);
    }

    /// A writer whose peer is gone.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Larger than the link's write buffer, so it reaches the writer at once.
    fn large() -> Message {
        Message::set("big", Bytes::from(vec![b'x'; 16 * 1024]), 0, false)
    }

    #[tokio::test]
    async fn test_link_abandons_after_consecutive_failures() {
        let mut link = Link::new(BrokenPipe);

        for _ in 1..MAX_SEND_FAILURES {
            assert!(!link.push(&large()).await.unwrap());
        }
        assert!(matches!(
            link.push(&large()).await,
            Err(ReplicationError::Abandoned { failures: MAX_SEND_FAILURES })
        ));
    }

    #[tokio::test]
    async fn test_link_success_resets_failures() {
        let mut link = Link::new(BrokenPipe);

        for _ in 1..MAX_SEND_FAILURES {
            assert!(!link.push(&large()).await.unwrap());
        }
        // Buffered without touching the writer.
        assert!(link.push(&Message::ping()).await.unwrap());

        for _ in 1..MAX_SEND_FAILURES {
            assert!(!link.push(&large()).await.unwrap());
        }
        assert!(link.push(&large()).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_replay_leaves_block_lagging() {
        let store = Arc::new(Store::in_memory(1, Duration::from_secs(60)));
        // A value holding the frame marker cannot be encoded.
        store.set("bad".into(), Slot::new("a+ENDb"), Origin::Local);
        let number = store.locate("bad").unwrap().number();
        let primary = Primary::start(Arc::clone(&store), 8).unwrap();

        let registration = Registration::new(Id::random(), 8, 0);
        let mut link = Link::new(tokio::io::sink());

        primary.replay(&registration, 0, number, &mut link).await.unwrap();
        assert_eq!(registration.outbox.lock().lagging_blocks(), vec![number]);
        assert!(registration.outbox.lock().watermarks.get(&number).is_none());

        store.set("bad".into(), Slot::new("fixed"), Origin::Local);
        primary.replay(&registration, 0, number, &mut link).await.unwrap();
        assert!(registration.outbox.lock().lagging_blocks().is_empty());
    }

    #[tokio::test]
    async fn test_newer_hello_takes_over_session() {
        let store = Arc::new(Store::in_memory(2, Duration::from_secs(60)));
        let primary = Primary::start(store, 8).unwrap();
        let replica_id = Id::random();

        let (first, first_session, directive) = primary.attach(&Hello {
            replica_id,
            primary_id: None,
            head: 0,
        });
        assert_eq!(directive.resync, Resync::Full);

        // The old connection went half-open and never detached.
        let (second, second_session, directive) = primary.attach(&Hello {
            replica_id,
            primary_id: Some(primary.id()),
            head: directive.head,
        });
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(directive.resync, Resync::None);
        assert_eq!(primary.registration_count(), 1);
        assert!(!second.is_current(first_session));
        assert!(second.outbox_for(first_session).is_none());

        second.detach(first_session);
        assert!(primary.is_attached(&replica_id));
        second.detach(second_session);
        assert!(!primary.is_attached(&replica_id));
    }
}
