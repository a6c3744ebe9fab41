//! Storage Errors
//!
//! Errors raised while building, loading or persisting the store.
//! Protocol, connection and replication errors live next to the code
//! that produces them.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from the storage layer and its on-disk state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error while touching the data directory
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A file could not be encoded or decoded
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// The manifest on disk was created with a different shard count
    #[error("manifest has {found} shards but {expected} are configured")]
    ShardMismatch { expected: usize, found: usize },

    /// The manifest exists but cannot be used
    #[error("invalid manifest at {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    /// Configuration rejected before anything was started
    #[error("configuration error: {0}")]
    Config(String),
}
