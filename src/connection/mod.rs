//! Connection Handler Module
//!
//! This module manages individual client connections to a blockkv node.
//! Each client connection is handled by its own async task, allowing
//! the server to handle thousands of concurrent clients efficiently.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (serve)                                  │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │   For each client...   │
//!           └────────────┬───────────┘
//!                        │
//!                        │ spawn task
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ Read frame  │───>│ Auth gate   │───>│ Execute req │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │                                               │             │
//! │                                               ▼             │
//! │                                      ┌─────────────┐        │
//! │                                      │ Send reply  │        │
//! │                                      └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Async I/O**: Uses Tokio for non-blocking network operations
//! - **Buffer Management**: Efficient BytesMut buffer for incoming data
//! - **Pipelining**: Supports multiple requests in a single TCP packet
//! - **Authentication**: Optional shared secret checked before privileged ops
//! - **Statistics**: Tracks connection and request metrics
//!
//! ## Example
//!
//! ```ignore
//! use blockkv::commands::CommandHandler;
//! use blockkv::connection::{serve, ConnectionSettings, ConnectionStats};
//! use blockkv::storage::Store;
//! use std::sync::Arc;
//!
//! let store = Arc::new(Store::in_memory(4, Duration::from_secs(60)));
//! let handler = CommandHandler::new(store, 100);
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//! serve(listener, handler, Arc::new(ConnectionSettings::default()),
//!       Arc::new(ConnectionStats::new()), shutdown_rx).await;
//! ```

pub mod handler;

// Re-export commonly used types
pub use handler::{
    handle_connection, serve, ConnectionError, ConnectionHandler, ConnectionSettings,
    ConnectionStats, Gate, Session,
};
