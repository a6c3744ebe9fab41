//! Configuration for blockkv
//!
//! Centralized configuration with sensible defaults. The server binary maps
//! its command-line arguments onto a [`Config`] through the builder.

use crate::error::{Result, StoreError};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a blockkv node
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Network
    // -------------------------------------------------------------------------
    /// TCP listen address for clients
    pub listen_addr: String,

    /// Shared secret; when set every connection must AUTH first
    pub auth_secret: Option<String>,

    /// Largest accepted frame, marker included (bytes)
    pub max_message_size: usize,

    /// Optional per-read timeout; timeouts count against the read backoff
    pub read_timeout: Option<Duration>,

    // -------------------------------------------------------------------------
    // Storage
    // -------------------------------------------------------------------------
    /// Number of parts, and of blocks per part (N parts, N² blocks)
    pub shards: usize,

    /// Keep blocks on disk
    pub persist: bool,

    /// Directory for the manifest, block files and replica state
    ///   {data_dir}/
    ///     ├── manifest
    ///     ├── <block id>...
    ///     └── replica
    pub data_dir: PathBuf,

    /// Interval between flushes of dirty blocks
    pub flush_interval: Duration,

    /// Interval between expiry sweeps
    pub sweep_interval: Duration,

    /// How long a deleted key lingers as a tombstone
    pub delete_grace: Duration,

    /// Channel capacity used when streaming LIST results
    pub list_buffer: usize,

    // -------------------------------------------------------------------------
    // Replication
    // -------------------------------------------------------------------------
    pub replication: Replication,
}

/// Replication role of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replication {
    /// Standalone node
    Disabled,

    /// Serves an op stream to replicas
    Primary {
        /// Listen address for replicas
        listen_addr: String,
        /// Ring capacity per replica (ops)
        buffer_size: usize,
    },

    /// Follows a primary
    Replica {
        /// Address of the primary's replication listener
        primary_addr: String,
        /// Delay before reconnecting after a session ends
        reconnect_delay: Duration,
    },
}

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8100";
pub const DEFAULT_REPL_ADDR: &str = "127.0.0.1:8101";
pub const DEFAULT_SHARDS: usize = 16;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 2_000_000; // 2 MB
pub const DEFAULT_REPL_BUFFER: usize = 10_000;

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            auth_secret: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_timeout: None,
            shards: DEFAULT_SHARDS,
            persist: false,
            data_dir: PathBuf::from("./blockkv_data"),
            flush_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(30),
            delete_grace: Duration::from_secs(60),
            list_buffer: 100,
            replication: Replication::Disabled,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Rejects settings the store cannot be built with.
    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(StoreError::Config("shard count must be at least 1".into()));
        }
        if self.max_message_size < crate::protocol::MIN_FRAME_LEN {
            return Err(StoreError::Config(format!(
                "max message size must be at least {} bytes",
                crate::protocol::MIN_FRAME_LEN
            )));
        }
        if let Replication::Primary { buffer_size: 0, .. } = self.replication {
            return Err(StoreError::Config("replication buffer must hold at least one op".into()));
        }
        if matches!(self.replication, Replication::Replica { .. }) && !self.persist {
            // replica state lives next to the blocks
            return Err(StoreError::Config("a replica requires persistence".into()));
        }
        Ok(())
    }

    pub fn is_replica(&self) -> bool {
        matches!(self.replication, Replication::Replica { .. })
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn auth_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.auth_secret = Some(secret.into());
        self
    }

    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.config.shards = shards;
        self
    }

    /// Enable persistence under `dir`
    pub fn persist(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.persist = true;
        self.config.data_dir = dir.into();
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn delete_grace(mut self, grace: Duration) -> Self {
        self.config.delete_grace = grace;
        self
    }

    pub fn list_buffer(mut self, capacity: usize) -> Self {
        self.config.list_buffer = capacity;
        self
    }

    pub fn primary(mut self, listen_addr: impl Into<String>, buffer_size: usize) -> Self {
        self.config.replication = Replication::Primary {
            listen_addr: listen_addr.into(),
            buffer_size,
        };
        self
    }

    pub fn replica_of(mut self, primary_addr: impl Into<String>) -> Self {
        self.config.replication = Replication::Replica {
            primary_addr: primary_addr.into(),
            reconnect_delay: crate::replication::replica::DEFAULT_RECONNECT_DELAY,
        };
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
