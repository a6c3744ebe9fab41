//! Storage Module
//!
//! This module provides the partitioned slot store, its on-disk state and
//! the background tasks that maintain it.
//!
//! ## Architecture
//!
//! ```text
//!                ┌───────────────────────────────┐
//!   key ──────▶  │ Store                         │
//!                │  Parts ─▶ Blocks (RwLock)     │ ──▶ MutationSink
//!                └───────────────────────────────┘     (replication)
//!                   ▲                   ▲
//!                   │                   │
//!        ┌──────────┴───────┐  ┌────────┴─────────┐
//!        │  ExpirySweeper   │  │     Flusher      │
//!        │  (Tokio task)    │  │  (Tokio task)    │
//!        └──────────────────┘  └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use blockkv::storage::{Origin, Slot, Store};
//! use std::time::Duration;
//!
//! let store = Store::in_memory(4, Duration::from_secs(60));
//! store.set("session".to_string(), Slot::with_expiry("token", 4_000_000_000), Origin::Local);
//! assert!(store.get("session").is_some());
//!
//! // Delete leaves a tombstone until the sweeper runs
//! store.delete("session");
//! assert!(store.get("session").is_some());
//! ```

pub mod block;
pub mod engine;
pub mod expiry;
pub mod id;
pub mod manifest;
pub mod placement;

// Re-export commonly used types
pub use block::{unix_now, Block, Mutation, MutationKind, MutationSink, Origin, Slot};
pub use engine::{Part, Store, StoreStats};
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};
pub use id::{hash_key, Id, KeyHash};
pub use manifest::{Flusher, Manifest};
