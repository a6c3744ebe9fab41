//! # blockkv - A Partitioned Key-Value Store
//!
//! blockkv is a networked key-value store written in Rust. Keys are spread
//! over a fixed grid of shards, persisted as one file per shard, and streamed
//! from a primary to any number of replicas.
//!
//! ## Features
//!
//! - **Two-level placement**: N parts of N blocks each, chosen by XOR distance
//!   between a key's hash and the shard identifiers
//! - **Binary protocol**: Fixed 20 byte header, UTF-8 key, opaque value and a
//!   `+END` marker per frame
//! - **Durability**: A manifest pins the shard layout; dirty blocks are
//!   written atomically on an interval
//! - **Expiry**: Per-key deadlines, deletes as short-lived tombstones, and a
//!   background sweeper that physically removes expired keys
//! - **Replication**: Offset-numbered op stream with resume, partial and full
//!   resync
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              blockkv                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │  (serve)    │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                                               ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐    │
//! │  │   Frame     │    │                  Store                       │    │
//! │  │   Codec     │    │  Part 0: [Block][Block]..  Part 1: [Block].. │    │
//! │  │             │    │  each Block: RwLock<slots, version, dirty>   │    │
//! │  └─────────────┘    └──────────┬───────────────────────┬───────────┘    │
//! │                                │ mutations             │ files          │
//! │                                ▼                       ▼                │
//! │                     ┌─────────────────────┐  ┌─────────────────────┐    │
//! │                     │ Primary broadcaster │  │ Manifest + Flusher  │    │
//! │                     │  ──> replicas       │  │ ExpirySweeper       │    │
//! │                     └─────────────────────┘  └─────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use blockkv::commands::CommandHandler;
//! use blockkv::connection::{serve, ConnectionSettings, ConnectionStats};
//! use blockkv::storage::{start_expiry_sweeper, Store};
//! use blockkv::Config;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::builder().persist("./data").build();
//!     let store = Arc::new(Store::open(&config)?);
//!     let _sweeper = start_expiry_sweeper(Arc::clone(&store), config.sweep_interval);
//!
//!     let listener = TcpListener::bind(&config.listen_addr).await?;
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     serve(
//!         listener,
//!         CommandHandler::new(store, config.list_buffer),
//!         Arc::new(ConnectionSettings::from(&config)),
//!         Arc::new(ConnectionStats::new()),
//!         shutdown_rx,
//!     )
//!     .await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: Identifiers, placement, blocks, manifest and expiry
//! - [`protocol`]: Frame codec, incremental parser and message streams
//! - [`commands`]: Request dispatch against the store
//! - [`connection`]: Client sessions and the accept loop
//! - [`replication`]: Primary fan-out and replica follower
//! - [`client`]: Async client used by the CLI
//! - [`config`]: Node configuration
//!
//! ## Design Highlights
//!
//! ### Locking
//!
//! Every block has its own `RwLock`. Reads share it, writes take it
//! exclusively, and nothing ever holds two block locks at once.
//!
//! ### Deletes
//!
//! A delete does not remove the key. It moves the key's expiry a grace
//! period into the future, so replicas observe the delete before the
//! sweeper removes the key everywhere.

pub mod client;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod replication;
pub mod storage;

// Re-export commonly used types for convenience
pub use client::{Client, ClientError};
pub use commands::CommandHandler;
pub use config::{
    Config, ConfigBuilder, Replication, DEFAULT_LISTEN_ADDR, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_REPL_ADDR, DEFAULT_SHARDS,
};
pub use connection::{handle_connection, serve, ConnectionSettings, ConnectionStats};
pub use error::{Result, StoreError};
pub use protocol::{Message, Op, Status};
pub use replication::{Primary, Replica, ReplicationError};
pub use storage::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper, Flusher, Slot, Store};

/// Version of blockkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
