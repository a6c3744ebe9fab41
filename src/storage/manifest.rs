//! Manifest and Durability
//!
//! The manifest records the identifier of every Part and Block. It is
//! written once, when a persistent store is first created, and read on
//! every later start so that placement stays stable across restarts.
//!
//! ## Data directory layout
//!
//! ```text
//! data/
//! ├── manifest                  bincode(Manifest)
//! ├── <block id, base64url>     bincode(HashMap<String, Slot>)
//! ├── <block id, base64url>
//! ├── ...
//! └── replica                   replica state, replicas only
//! ```
//!
//! Every file is written to a `.tmp` sibling first and renamed into place.

use crate::error::{Result, StoreError};
use crate::storage::engine::Store;
use crate::storage::id::Id;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Name of the manifest file inside the data directory.
pub const MANIFEST_FILE: &str = "manifest";

/// Default interval between flushes of dirty blocks.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockManifest {
    pub id: Id,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartManifest {
    pub id: Id,
    pub blocks: Vec<BlockManifest>,
}

/// The fixed set of Part and Block identifiers of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub parts: Vec<PartManifest>,
}

impl Manifest {
    /// Generates `shards` parts of `shards` blocks each, all with fresh ids.
    pub fn generate(shards: usize) -> Self {
        let parts = (0..shards)
            .map(|_| PartManifest {
                id: Id::random(),
                blocks: (0..shards)
                    .map(|_| BlockManifest { id: Id::random() })
                    .collect(),
            })
            .collect();
        Self { parts }
    }

    pub fn block_count(&self) -> usize {
        self.parts.iter().map(|p| p.blocks.len()).sum()
    }

    /// Checks that the manifest was created for `shards` shards.
    pub fn validate(&self, shards: usize) -> Result<()> {
        if self.parts.len() != shards {
            return Err(StoreError::ShardMismatch {
                expected: shards,
                found: self.parts.len(),
            });
        }
        for part in &self.parts {
            if part.blocks.len() != shards {
                return Err(StoreError::ShardMismatch {
                    expected: shards,
                    found: part.blocks.len(),
                });
            }
        }
        Ok(())
    }

    /// Reads the manifest from `dir`. Returns `Ok(None)` if there is none.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        bincode::deserialize(&data)
            .map(Some)
            .map_err(|e| StoreError::InvalidManifest {
                path,
                reason: e.to_string(),
            })
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let data = bincode::serialize(self)?;
        write_atomic(&dir.join(MANIFEST_FILE), &data)?;
        Ok(())
    }
}

/// Writes `data` to a temporary sibling of `path`, then renames it over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

// ============================================================================
// Periodic flusher
// ============================================================================

/// A handle to the background task that flushes dirty blocks.
///
/// When this handle is dropped, the flusher task will be stopped. The final
/// flush on shutdown is the caller's job, see [`Store::flush_dirty`].
#[derive(Debug)]
pub struct Flusher {
    shutdown_tx: watch::Sender<bool>,
}

impl Flusher {
    /// Starts flushing `store` every `interval`.
    pub fn start(store: Arc<Store>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(flusher_loop(store, interval, shutdown_rx));

        info!(interval_ms = interval.as_millis() as u64, "Block flusher started");

        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn flusher_loop(store: Arc<Store>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Block flusher received shutdown signal");
                    return;
                }
            }
        }

        let store = Arc::clone(&store);
        match tokio::task::spawn_blocking(move || store.flush_dirty()).await {
            Ok(0) => {}
            Ok(written) => debug!(blocks = written, "Dirty blocks flushed"),
            Err(e) => warn!(error = %e, "Flush task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let manifest = Manifest::generate(3);
        assert_eq!(manifest.parts.len(), 3);
        assert!(manifest.parts.iter().all(|p| p.blocks.len() == 3));
        assert_eq!(manifest.block_count(), 9);
        assert!(manifest.validate(3).is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::generate(2);
        manifest.save(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert!(!dir.path().join("manifest.tmp").exists());
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Manifest::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_load_garbage_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), b"\x01").unwrap();
        assert!(matches!(
            Manifest::load(dir.path()),
            Err(StoreError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_shard_mismatch() {
        let manifest = Manifest::generate(2);
        assert!(matches!(
            manifest.validate(4),
            Err(StoreError::ShardMismatch { expected: 4, found: 2 })
        ));

        let mut uneven = Manifest::generate(2);
        uneven.parts[1].blocks.pop();
        assert!(matches!(
            uneven.validate(2),
            Err(StoreError::ShardMismatch { expected: 2, found: 1 })
        ));
    }
}
