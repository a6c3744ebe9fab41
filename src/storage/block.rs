//! Blocks and Slots
//!
//! A [`Block`] is the unit of locking, persistence and replication catch-up.
//! It owns a map from key to [`Slot`] behind a single reader/writer lock.
//! Every read-then-mutate sequence that flips the dirty flag happens under
//! the exclusive lock.
//!
//! Local mutations bump the block version and are handed to the optional
//! [`MutationSink`] while the lock is still held, so the sink observes
//! mutations of one key in the same order they were applied.

use crate::error::Result;
use crate::storage::id::Id;
use crate::storage::manifest::write_atomic;
use crate::storage::placement::Identified;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A stored value with its expiry and last-modified time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub value: Bytes,
    /// Unix seconds, 0 = never
    pub expires: u64,
    /// Unix seconds of the last write
    pub modified: u64,
}

impl Slot {
    /// A slot that never expires.
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            expires: 0,
            modified: 0,
        }
    }

    /// A slot that expires at the given unix time (0 = never).
    pub fn with_expiry(value: impl Into<Bytes>, expires: u64) -> Self {
        Self {
            value: value.into(),
            expires,
            modified: 0,
        }
    }

    /// True once `expires` is set and lies in the past.
    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires != 0 && now > self.expires
    }
}

/// Where a write comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A client of this node; stamped with the local clock.
    Local,
    /// A primary's op stream; keeps its own timestamp, last write wins.
    Replicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Set,
    Delete,
}

/// A local mutation as seen by the replication layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub key: String,
    pub slot: Slot,
    /// Number of the block that applied it
    pub block: u64,
    /// Block version after it was applied
    pub version: u64,
}

/// Receives every local mutation while the owning block is locked.
///
/// Implementations must not block and must not call back into the store.
pub trait MutationSink: Send + Sync {
    fn record(&self, mutation: Mutation);
}

#[derive(Debug, Default)]
struct BlockState {
    slots: HashMap<String, Slot>,
    dirty: bool,
    version: u64,
}

/// A fine-grained shard holding a portion of the keyspace.
#[derive(Debug)]
pub struct Block {
    id: Id,
    number: u64,
    state: RwLock<BlockState>,
}

impl Identified for Block {
    fn id(&self) -> &Id {
        &self.id
    }
}

impl Block {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            number: id.number(),
            state: RwLock::new(BlockState::default()),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Path of this block's file inside `dir`.
    pub fn file_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.id.name())
    }

    /// Returns a copy of the slot stored under `key`.
    pub fn get(&self, key: &str) -> Option<Slot> {
        self.state.read().slots.get(key).cloned()
    }

    /// Stores a slot.
    ///
    /// Replicated writes older than the stored slot are dropped. Returns
    /// whether the slot was stored.
    pub fn set(
        &self,
        key: String,
        mut slot: Slot,
        origin: Origin,
        sink: Option<&dyn MutationSink>,
    ) -> bool {
        let mut state = self.state.write();
        let existing = state.slots.get(&key).map(|s| s.modified);

        match origin {
            Origin::Replicated => {
                if matches!(existing, Some(modified) if modified > slot.modified) {
                    return false;
                }
            }
            Origin::Local => {
                slot.modified = unix_now().max(existing.unwrap_or(0));
            }
        }

        state.dirty = true;
        if origin == Origin::Replicated {
            state.slots.insert(key, slot);
            return true;
        }

        state.version += 1;
        let version = state.version;
        if let Some(sink) = sink {
            sink.record(Mutation {
                kind: MutationKind::Set,
                key: key.clone(),
                slot: slot.clone(),
                block: self.number,
                version,
            });
        }
        state.slots.insert(key, slot);
        true
    }

    /// Tombstones a key: it expires `grace` seconds from now.
    ///
    /// The key stays readable until the sweeper removes it, which gives
    /// replicas a window to observe the delete. Absent keys are left alone.
    pub fn delete(&self, key: &str, grace: u64, sink: Option<&dyn MutationSink>) -> bool {
        let mut state = self.state.write();
        let now = unix_now();

        let tombstone = match state.slots.get_mut(key) {
            Some(slot) => {
                slot.expires = now + grace;
                slot.modified = now.max(slot.modified);
                slot.clone()
            }
            None => return false,
        };

        state.dirty = true;
        state.version += 1;
        let version = state.version;
        if let Some(sink) = sink {
            sink.record(Mutation {
                kind: MutationKind::Delete,
                key: key.to_string(),
                slot: tombstone,
                block: self.number,
                version,
            });
        }
        true
    }

    /// Applies a tombstone received from a primary, last write wins.
    pub fn delete_replicated(&self, key: &str, expires: u64, modified: u64) -> bool {
        let mut state = self.state.write();

        match state.slots.get_mut(key) {
            Some(slot) if slot.modified <= modified => {
                slot.expires = expires;
                slot.modified = modified;
            }
            _ => return false,
        }

        state.dirty = true;
        true
    }

    /// Keys starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.state
            .read()
            .slots
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn count_prefix(&self, prefix: &str) -> u64 {
        self.state
            .read()
            .slots
            .keys()
            .filter(|k| k.starts_with(prefix))
            .count() as u64
    }

    pub fn len(&self) -> usize {
        self.state.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Copies every slot together with the version they correspond to.
    pub fn snapshot(&self) -> (Vec<(String, Slot)>, u64) {
        let state = self.state.read();
        let slots = state
            .slots
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        (slots, state.version)
    }

    /// Physically removes slots that expired before `now`.
    ///
    /// Expired keys are collected under the shared lock and deleted in a
    /// single exclusive pass. Each key is checked again under the exclusive
    /// lock, since it may have been rewritten in between.
    pub fn remove_expired(&self, now: u64) -> usize {
        let expired: Vec<String> = {
            let state = self.state.read();
            state
                .slots
                .iter()
                .filter(|(_, slot)| slot.is_expired_at(now))
                .map(|(k, _)| k.clone())
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        let mut state = self.state.write();
        let mut removed = 0;
        for key in expired {
            if state.slots.get(&key).is_some_and(|s| s.is_expired_at(now)) {
                state.slots.remove(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            state.dirty = true;
        }
        removed
    }

    /// Replaces the slots with the contents of this block's file in `dir`.
    ///
    /// Returns `Ok(None)` when there is no file yet.
    pub fn load(&self, dir: &Path) -> Result<Option<usize>> {
        let path = self.file_path(dir);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let slots: HashMap<String, Slot> = bincode::deserialize(&data)?;
        let count = slots.len();

        let mut state = self.state.write();
        state.slots = slots;
        state.dirty = false;
        Ok(Some(count))
    }

    /// Writes the block to `dir` if it is dirty, then clears the flag.
    ///
    /// Returns whether a file was written. On error the block stays dirty.
    pub fn flush(&self, dir: &Path) -> Result<bool> {
        let mut state = self.state.write();
        if !state.dirty {
            return Ok(false);
        }

        let data = bincode::serialize(&state.slots)?;
        write_atomic(&self.file_path(dir), &data)?;
        state.dirty = false;

        trace!(block = %self.id, slots = state.slots.len(), "Block flushed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Mutation>>);

    impl MutationSink for Recorder {
        fn record(&self, mutation: Mutation) {
            self.0.lock().push(mutation);
        }
    }

    fn block() -> Block {
        Block::new(Id::random())
    }

    #[test]
    fn test_set_and_get() {
        let block = block();
        assert!(block.set("k".into(), Slot::new("v"), Origin::Local, None));

        let slot = block.get("k").unwrap();
        assert_eq!(slot.value, Bytes::from("v"));
        assert!(slot.modified > 0);
        assert!(block.is_dirty());
    }

    #[test]
    fn test_local_set_stamps_modified() {
        let block = block();
        let mut slot = Slot::new("v");
        slot.modified = 1;
        block.set("k".into(), slot, Origin::Local, None);
        assert!(block.get("k").unwrap().modified >= unix_now() - 1);
    }

    #[test]
    fn test_replicated_set_older_is_ignored() {
        let block = block();
        let mut newer = Slot::new("new");
        newer.modified = 200;
        let mut older = Slot::new("old");
        older.modified = 100;

        assert!(block.set("k".into(), newer, Origin::Replicated, None));
        assert!(!block.set("k".into(), older, Origin::Replicated, None));
        assert_eq!(block.get("k").unwrap().value, Bytes::from("new"));
    }

    #[test]
    fn test_replicated_set_keeps_timestamp() {
        let block = block();
        let mut slot = Slot::new("v");
        slot.modified = 42;
        block.set("k".into(), slot, Origin::Replicated, None);
        assert_eq!(block.get("k").unwrap().modified, 42);
    }

    #[test]
    fn test_only_local_writes_are_recorded() {
        let block = block();
        let sink = Recorder::default();

        block.set("a".into(), Slot::new("1"), Origin::Local, Some(&sink));
        let mut remote = Slot::new("2");
        remote.modified = unix_now() + 10;
        block.set("b".into(), remote, Origin::Replicated, Some(&sink));
        block.delete("a", 5, Some(&sink));

        let recorded = sink.0.lock();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].kind, MutationKind::Set);
        assert_eq!(recorded[0].version, 1);
        assert_eq!(recorded[1].kind, MutationKind::Delete);
        assert_eq!(recorded[1].version, 2);
        assert_eq!(recorded[1].block, block.number());
        assert_eq!(block.version(), 2);
    }

    #[test]
    fn test_delete_tombstones() {
        let block = block();
        block.set("k".into(), Slot::new("v"), Origin::Local, None);

        assert!(block.delete("k", 60, None));
        let slot = block.get("k").expect("tombstone still readable");
        assert!(slot.expires >= unix_now() + 59);
        assert_eq!(slot.value, Bytes::from("v"));
    }

    #[test]
    fn test_delete_absent_key() {
        let block = block();
        assert!(!block.delete("missing", 60, None));
        assert!(!block.is_dirty());
        assert_eq!(block.version(), 0);
    }

    #[test]
    fn test_delete_replicated_respects_timestamps() {
        let block = block();
        let mut slot = Slot::new("v");
        slot.modified = 100;
        block.set("k".into(), slot, Origin::Replicated, None);

        assert!(!block.delete_replicated("k", 500, 50));
        assert_eq!(block.get("k").unwrap().expires, 0);

        assert!(block.delete_replicated("k", 500, 150));
        let slot = block.get("k").unwrap();
        assert_eq!(slot.expires, 500);
        assert_eq!(slot.modified, 150);
    }

    #[test]
    fn test_remove_expired() {
        let block = block();
        block.set("gone".into(), Slot::with_expiry("v", 10), Origin::Local, None);
        block.set("kept".into(), Slot::with_expiry("v", 1000), Origin::Local, None);
        block.set("forever".into(), Slot::new("v"), Origin::Local, None);

        assert_eq!(block.remove_expired(500), 1);
        assert!(block.get("gone").is_none());
        assert!(block.get("kept").is_some());
        assert!(block.get("forever").is_some());
        assert_eq!(block.remove_expired(500), 0);
    }

    #[test]
    fn test_prefix_scan() {
        let block = block();
        for key in ["user:1", "user:2", "order:1"] {
            block.set(key.into(), Slot::new("v"), Origin::Local, None);
        }
        let mut keys = block.keys_with_prefix("user:");
        keys.sort();
        assert_eq!(keys, vec!["user:1".to_string(), "user:2".to_string()]);
        assert_eq!(block.count_prefix(""), 3);
    }

    #[test]
    fn test_flush_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let id = Id::random();

        let block = Block::new(id);
        block.set("k".into(), Slot::with_expiry("v", 99), Origin::Local, None);
        assert!(block.flush(dir.path()).unwrap());
        assert!(!block.is_dirty());
        assert!(!block.flush(dir.path()).unwrap());

        let reloaded = Block::new(id);
        assert_eq!(reloaded.load(dir.path()).unwrap(), Some(1));
        assert_eq!(reloaded.get("k"), block.get("k"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(block().load(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let block = block();
        std::fs::write(block.file_path(dir.path()), b"\xff\xff\xff\xff not bincode").unwrap();
        assert!(block.load(dir.path()).is_err());
        assert!(block.is_empty());
    }
}
