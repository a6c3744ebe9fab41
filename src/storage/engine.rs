//! Partitioned Slot Store
//!
//! The store routes every key in two steps: to the closest [`Part`], then to
//! the closest [`Block`] inside it. Blocks are the unit of locking, so
//! operations on keys in different blocks never contend.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            Store                             │
//! │  ┌────────────────────┐  ┌────────────────────┐              │
//! │  │ Part (id)          │  │ Part (id)          │     N parts  │
//! │  │ ┌───────┐┌───────┐ │  │ ┌───────┐┌───────┐ │              │
//! │  │ │ Block ││ Block │ │  │ │ Block ││ Block │ │  N blocks    │
//! │  │ │RwLock ││RwLock │ │  │ │RwLock ││RwLock │ │  per part    │
//! │  │ └───────┘└───────┘ │  │ └───────┘└───────┘ │              │
//! │  └────────────────────┘  └────────────────────┘              │
//! └──────────────────────────────────────────────────────────────┘
//!        key ──hash──▶ closest Part ──▶ closest Block
//! ```
//!
//! Identifiers are fixed when the store is created. With persistence on
//! they come from the manifest; otherwise they are generated in memory.
//!
//! ## Expiry
//!
//! There is no lazy expiry. An expired or tombstoned slot stays readable
//! until the sweeper removes it.

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::storage::block::{unix_now, Block, MutationSink, Origin, Slot};
use crate::storage::id::{hash_key, Id, NAMESPACE_SEPARATOR};
use crate::storage::manifest::{BlockManifest, Manifest, PartManifest};
use crate::storage::placement::{closest, Identified};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// First routing level: a fixed group of blocks.
#[derive(Debug)]
pub struct Part {
    id: Id,
    blocks: Vec<Arc<Block>>,
}

impl Identified for Part {
    fn id(&self) -> &Id {
        &self.id
    }
}

impl Part {
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }
}

/// The partitioned key-value store.
///
/// Built once at startup and shared as `Arc<Store>` by connections, the
/// sweeper, the flusher and replication.
///
/// # Example
///
/// ```
/// use blockkv::storage::{Origin, Slot, Store};
/// use std::time::Duration;
///
/// let store = Store::in_memory(2, Duration::from_secs(60));
/// store.set("users/42".to_string(), Slot::new("Ariz"), Origin::Local);
///
/// let slot = store.get("users/42").unwrap();
/// assert_eq!(&slot.value[..], b"Ariz");
/// ```
pub struct Store {
    parts: Vec<Part>,
    /// Blocks by id number
    index: HashMap<u64, Arc<Block>>,
    dir: Option<PathBuf>,
    /// Tombstone lifetime in seconds
    delete_grace: u64,
    sink: OnceLock<Arc<dyn MutationSink>>,

    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("parts", &self.parts.len())
            .field("blocks", &self.index.len())
            .field("dir", &self.dir)
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Store {
    /// Creates a store with fresh identifiers that lives only in memory.
    pub fn in_memory(shards: usize, delete_grace: Duration) -> Self {
        Self::build(&Manifest::generate(shards.max(1)), None, delete_grace)
    }

    /// Creates the store described by `config`.
    ///
    /// With persistence on, this reads (or first writes) the manifest and
    /// hydrates every block from its file.
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        if config.persist {
            Self::open_dir(&config.data_dir, config.shards, config.delete_grace)
        } else {
            Ok(Self::in_memory(config.shards, config.delete_grace))
        }
    }

    /// Opens or creates a persistent store in `dir`.
    pub fn open_dir(dir: &Path, shards: usize, delete_grace: Duration) -> Result<Self> {
        if shards == 0 {
            return Err(StoreError::Config("shard count must be at least 1".into()));
        }
        std::fs::create_dir_all(dir)?;

        let manifest = match Manifest::load(dir)? {
            Some(manifest) => {
                manifest.validate(shards)?;
                info!(dir = %dir.display(), blocks = manifest.block_count(), "Manifest loaded");
                manifest
            }
            None => {
                let manifest = Manifest::generate(shards);
                manifest.save(dir)?;
                info!(dir = %dir.display(), blocks = manifest.block_count(), "Manifest created");
                manifest
            }
        };

        let store = Self::build(&manifest, Some(dir.to_path_buf()), delete_grace);
        if store.index.len() != manifest.block_count() {
            return Err(StoreError::InvalidManifest {
                path: dir.join(crate::storage::manifest::MANIFEST_FILE),
                reason: "duplicate block identifiers".into(),
            });
        }
        store.hydrate(dir);
        Ok(store)
    }

    fn build(manifest: &Manifest, dir: Option<PathBuf>, delete_grace: Duration) -> Self {
        let mut index = HashMap::new();
        let parts = manifest
            .parts
            .iter()
            .map(|part| {
                let blocks = part
                    .blocks
                    .iter()
                    .map(|b| {
                        let block = Arc::new(Block::new(b.id));
                        index.insert(block.number(), Arc::clone(&block));
                        block
                    })
                    .collect();
                Part {
                    id: part.id,
                    blocks,
                }
            })
            .collect();

        Self {
            parts,
            index,
            dir,
            delete_grace: delete_grace.as_secs(),
            sink: OnceLock::new(),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    /// Loads every block from its file. Unreadable files leave the block empty.
    fn hydrate(&self, dir: &Path) {
        let mut loaded = 0usize;
        for block in self.blocks() {
            match block.load(dir) {
                Ok(Some(count)) => {
                    loaded += count;
                    debug!(block = %block.id(), slots = count, "Block hydrated");
                }
                Ok(None) => {}
                Err(e) => warn!(block = %block.id(), error = %e, "Block file unreadable, starting empty"),
            }
        }
        info!(keys = loaded, "Store hydrated");
    }

    /// Installs the receiver of local mutations. Only the first call wins.
    pub fn attach_sink(&self, sink: Arc<dyn MutationSink>) -> bool {
        self.sink.set(sink).is_ok()
    }

    fn sink(&self) -> Option<&dyn MutationSink> {
        self.sink.get().map(|s| s.as_ref())
    }

    // ========================================================================
    // Placement
    // ========================================================================

    /// Returns the block that owns `key`.
    pub fn locate(&self, key: &str) -> Option<&Arc<Block>> {
        let hash = hash_key(key);
        let part = closest(&self.parts, &hash)?;
        closest(&part.blocks, &hash)
    }

    /// Blocks that may hold keys starting with `prefix`.
    fn candidates(&self, prefix: &str) -> Vec<Arc<Block>> {
        if prefix.contains(NAMESPACE_SEPARATOR) {
            self.locate(prefix).into_iter().cloned().collect()
        } else {
            self.blocks().cloned().collect()
        }
    }

    // ========================================================================
    // Slot operations
    // ========================================================================

    pub fn get(&self, key: &str) -> Option<Slot> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.locate(key)?.get(key)
    }

    /// Stores `slot` under `key`. Returns whether it was applied.
    pub fn set(&self, key: String, slot: Slot, origin: Origin) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        match self.locate(&key) {
            Some(block) => block.set(key, slot, origin, self.sink()),
            None => false,
        }
    }

    /// Tombstones `key` for the configured grace period.
    pub fn delete(&self, key: &str) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);
        match self.locate(key) {
            Some(block) => block.delete(key, self.delete_grace, self.sink()),
            None => false,
        }
    }

    /// Applies a tombstone received from a primary.
    pub fn delete_replicated(&self, key: &str, expires: u64, modified: u64) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);
        match self.locate(key) {
            Some(block) => block.delete_replicated(key, expires, modified),
            None => false,
        }
    }

    /// Streams every key starting with `prefix`.
    ///
    /// One task per candidate block collects its matches and feeds them into
    /// a channel of `buffer` capacity. Dropping the receiver stops them.
    /// Must be called from within a Tokio runtime.
    pub fn list(&self, prefix: &str, buffer: usize) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(buffer.max(1));

        for block in self.candidates(prefix) {
            let tx = tx.clone();
            let prefix = prefix.to_string();
            tokio::spawn(async move {
                for key in block.keys_with_prefix(&prefix) {
                    if tx.send(key).await.is_err() {
                        return;
                    }
                }
            });
        }

        rx
    }

    /// Counts keys starting with `prefix` across candidate blocks concurrently.
    pub async fn count(&self, prefix: &str) -> u64 {
        let mut tasks = JoinSet::new();
        for block in self.candidates(prefix) {
            let prefix = prefix.to_string();
            tasks.spawn(async move { block.count_prefix(&prefix) });
        }

        let mut total = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(n) => total += n,
                Err(e) => warn!(error = %e, "Count task failed"),
            }
        }
        total
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Removes expired slots from every block concurrently.
    ///
    /// When persistent, each block is flushed after its pass. Returns the
    /// number of removed slots once the whole cycle is done.
    pub async fn sweep_expired(&self) -> u64 {
        let now = unix_now();
        let mut tasks = JoinSet::new();

        for block in self.blocks() {
            let block = Arc::clone(block);
            let dir = self.dir.clone();
            tasks.spawn_blocking(move || {
                let removed = block.remove_expired(now);
                if let Some(dir) = dir {
                    if let Err(e) = block.flush(&dir) {
                        warn!(block = %block.id(), error = %e, "Block flush after sweep failed");
                    }
                }
                removed as u64
            });
        }

        let mut removed = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(n) => removed += n,
                Err(e) => warn!(error = %e, "Sweep task failed"),
            }
        }

        if removed > 0 {
            self.expired_count.fetch_add(removed, Ordering::Relaxed);
        }
        removed
    }

    /// Writes every dirty block to the data directory.
    ///
    /// Blocking; returns the number of blocks written. Failures are logged
    /// and the block stays dirty for the next attempt.
    pub fn flush_dirty(&self) -> usize {
        let Some(dir) = &self.dir else {
            return 0;
        };

        let mut written = 0;
        for block in self.blocks() {
            match block.flush(dir) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => warn!(block = %block.id(), error = %e, "Block flush failed"),
            }
        }
        written
    }

    /// Like [`flush_dirty`](Self::flush_dirty), but stops at the first block
    /// that cannot be written.
    pub fn try_flush_dirty(&self) -> Result<usize> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };

        let mut written = 0;
        for block in self.blocks() {
            if block.flush(dir)? {
                written += 1;
            }
        }
        Ok(written)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Every block, parts in manifest order, blocks in manifest order.
    pub fn blocks(&self) -> impl Iterator<Item = &Arc<Block>> {
        self.parts.iter().flat_map(|p| p.blocks.iter())
    }

    pub fn block(&self, number: u64) -> Option<&Arc<Block>> {
        self.index.get(&number)
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Number of stored slots, tombstones included.
    pub fn len(&self) -> usize {
        self.blocks().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    pub fn manifest(&self) -> Manifest {
        Manifest {
            parts: self
                .parts
                .iter()
                .map(|part| PartManifest {
                    id: part.id,
                    blocks: part
                        .blocks
                        .iter()
                        .map(|b| BlockManifest { id: Block::id(b) })
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.len() as u64,
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }
}

/// Store statistics.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    /// Number of slots currently stored
    pub keys: u64,
    /// Total GET operations
    pub get_ops: u64,
    /// Total SET operations
    pub set_ops: u64,
    /// Total DEL operations
    pub del_ops: u64,
    /// Total expired slots removed by the sweeper
    pub expired: u64,
}
