//! Replica Side
//!
//! A replica connects to its primary, presents its stored position, applies
//! the resync and then every streamed op. Its position is kept in the
//! `replica` file of the data directory:
//!
//! - `replica_id`: chosen once, when the file is first created
//! - `primary_id`: the primary whose stream `head` refers to
//! - `head`: offset of the newest applied op
//!
//! Position updates mark the state dirty; a [`StateSaver`] writes it out
//! periodically and [`Replica::run`] writes it once more on shutdown.

use super::op::{is_resync_end, Directive, Hello, ReplOp, Resync};
use super::ReplicationError;
use crate::config::{Config, Replication};
use crate::connection::ConnectionSettings;
use crate::error::{Result, StoreError};
use crate::protocol::{write_message, Message, MessageReader, Status};
use crate::storage::manifest::write_atomic;
use crate::storage::{Id, MutationKind, Origin, Store};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufWriter;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// File holding the replica's position.
pub const STATE_FILE: &str = "replica";

/// Default interval between state saves.
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(10);

/// Default delay before reconnecting to the primary.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Persisted position of a replica in its primary's op stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub replica_id: Id,
    pub primary_id: Option<Id>,
    pub head: u64,
}

impl ReplicaState {
    pub fn fresh() -> Self {
        Self {
            replica_id: Id::random(),
            primary_id: None,
            head: 0,
        }
    }

    /// Reads the state file, or returns `None` if there is none.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(STATE_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(bincode::deserialize(&data)?))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        write_atomic(&dir.join(STATE_FILE), &bincode::serialize(self)?)?;
        Ok(())
    }
}

/// The replica end of replication.
#[derive(Debug)]
pub struct Replica {
    store: Arc<Store>,
    dir: PathBuf,
    primary_addr: String,
    settings: Arc<ConnectionSettings>,
    reconnect_delay: Duration,
    state: Mutex<ReplicaState>,
    dirty: AtomicBool,
}

impl Replica {
    /// Loads or creates the replica state in the store's data directory.
    pub fn open(
        store: Arc<Store>,
        primary_addr: impl Into<String>,
        settings: Arc<ConnectionSettings>,
        reconnect_delay: Duration,
    ) -> Result<Arc<Self>> {
        let dir = store
            .dir()
            .ok_or_else(|| StoreError::Config("a replica needs a data directory".into()))?
            .to_path_buf();

        let state = match ReplicaState::load(&dir)? {
            Some(state) => state,
            None => {
                let state = ReplicaState::fresh();
                state.save(&dir)?;
                state
            }
        };
        info!(replica = %state.replica_id, head = state.head, "Replica state loaded");

        Ok(Arc::new(Self {
            store,
            dir,
            primary_addr: primary_addr.into(),
            settings,
            reconnect_delay,
            state: Mutex::new(state),
            dirty: AtomicBool::new(false),
        }))
    }

    /// Opens a replica as described by `config`.
    pub fn from_config(store: Arc<Store>, config: &Config) -> Result<Arc<Self>> {
        match &config.replication {
            Replication::Replica {
                primary_addr,
                reconnect_delay,
            } => Self::open(
                store,
                primary_addr.clone(),
                Arc::new(ConnectionSettings::from(config)),
                *reconnect_delay,
            ),
            _ => Err(StoreError::Config("replication is not configured as a replica".into())),
        }
    }

    pub fn state(&self) -> ReplicaState {
        *self.state.lock()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Writes the state file if the position changed since the last save.
    ///
    /// Dirty blocks are flushed first, so the saved head never runs ahead of
    /// the slots on disk.
    pub fn save(&self) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let state = self.state();
        let saved = self
            .store
            .try_flush_dirty()
            .and_then(|_| state.save(&self.dir));
        if let Err(e) = saved {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(head = state.head, "Replica state saved");
        Ok(true)
    }

    /// Follows the primary, reconnecting after every session, until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(primary_addr = %self.primary_addr, "Replica started");

        loop {
            tokio::select! {
                result = self.follow() => match result {
                    Ok(()) => info!("Primary closed the replication stream"),
                    Err(e) => warn!(error = %e, "Replication session failed"),
                },
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        if let Err(e) = self.save() {
            error!(error = %e, "Failed to save replica state");
        }
        info!("Replica stopped");
    }

    /// Runs one session against the primary.
    pub async fn follow(&self) -> std::result::Result<(), ReplicationError> {
        let stream = TcpStream::connect(&self.primary_addr).await?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half, self.settings.max_message_size);
        let mut writer = BufWriter::new(write_half);

        if let Some(secret) = &self.settings.auth_secret {
            write_message(&mut writer, &Message::auth(secret.clone())).await?;
            let reply = next(&mut reader).await?;
            if !reply.is_status(Status::Ok) {
                return Err(ReplicationError::Unauthorized);
            }
        }

        let state = self.state();
        let hello = Hello {
            replica_id: state.replica_id,
            primary_id: state.primary_id,
            head: state.head,
        };
        write_message(&mut writer, &hello.to_message()).await?;

        let directive = Directive::from_message(&next(&mut reader).await?)?;
        info!(
            primary = %directive.primary_id,
            resync = ?directive.resync,
            head = directive.head,
            "Following primary"
        );

        let mut replayed = 0u64;
        loop {
            let msg = next(&mut reader).await?;
            if is_resync_end(&msg) {
                break;
            }
            self.apply(&msg)?;
            replayed += 1;
        }

        // The position only moves to the new stream once its resync is complete.
        {
            let mut state = self.state.lock();
            state.primary_id = Some(directive.primary_id);
            if directive.resync == Resync::Full {
                state.head = directive.head;
            }
        }
        self.dirty.store(true, Ordering::Release);
        if let Err(e) = self.save() {
            warn!(error = %e, "Failed to save replica state after resync");
        }
        debug!(slots = replayed, "Resync applied");

        while let Some(msg) = reader.read_message().await? {
            self.apply(&msg)?;
        }
        Ok(())
    }

    /// Applies one op from the primary.
    fn apply(&self, msg: &Message) -> std::result::Result<(), ReplicationError> {
        let op = ReplOp::from_message(msg)?;
        let offset = op.offset;

        match op.kind {
            MutationKind::Set => {
                self.store.set(op.key, op.slot, Origin::Replicated);
            }
            MutationKind::Delete => {
                self.store
                    .delete_replicated(&op.key, op.slot.expires, op.slot.modified);
            }
        }

        if offset > 0 {
            let mut state = self.state.lock();
            if offset > state.head {
                state.head = offset;
                self.dirty.store(true, Ordering::Release);
            }
        }
        Ok(())
    }
}

async fn next<R>(reader: &mut MessageReader<R>) -> std::result::Result<Message, ReplicationError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    reader
        .read_message()
        .await?
        .ok_or_else(|| ReplicationError::Malformed("primary closed the stream mid-handshake".into()))
}

/// Periodically saves a replica's state.
///
/// The saver stops when dropped.
pub struct StateSaver {
    shutdown_tx: watch::Sender<bool>,
}

impl StateSaver {
    pub fn start(replica: Arc<Replica>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(saver_loop(replica, interval, shutdown_rx));

        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for StateSaver {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn saver_loop(replica: Arc<Replica>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Replica state saver received shutdown signal");
                    return;
                }
            }
        }

        let saving = Arc::clone(&replica);
        match tokio::task::spawn_blocking(move || saving.save()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to save replica state"),
            Err(e) => error!(error = %e, "Replica state save task failed"),
        }
    }
}
