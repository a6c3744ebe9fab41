//! Background Expiry Sweeper
//!
//! Deleted keys are tombstones and expired keys stay readable: nothing is
//! removed on access. This task is the only thing that physically removes
//! slots.
//!
//! ## Design
//!
//! The sweeper runs as a Tokio task and:
//! 1. Sleeps for a fixed interval (default: 30s)
//! 2. Sweeps every block concurrently, snapshot-then-mutate per block
//! 3. Flushes each swept block when the store is persistent
//! 4. Waits for the whole cycle before sleeping again

use crate::storage::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Interval between sweeps (default: 30s)
    pub interval: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the expiry sweeper as a background task.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use blockkv::storage::{ExpiryConfig, ExpirySweeper, Store};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let store = Arc::new(Store::in_memory(4, Duration::from_secs(60)));
    /// let sweeper = ExpirySweeper::start(store, ExpiryConfig::default());
    ///
    /// // Dropping the sweeper will stop it
    /// drop(sweeper);
    /// ```
    pub fn start(store: Arc<Store>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interval_ms = config.interval.as_millis() as u64;

        tokio::spawn(sweeper_loop(store, config, shutdown_rx));

        info!(interval_ms, "Background expiry sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the expiry sweeper.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        if !*self.shutdown_tx.borrow() {
            let _ = self.shutdown_tx.send(true);
            info!("Background expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main sweeper loop.
async fn sweeper_loop(store: Arc<Store>, config: ExpiryConfig, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        let expired = store.sweep_expired().await;

        if expired > 0 {
            debug!(
                expired = expired,
                keys_remaining = store.len(),
                "Expired keys cleaned up"
            );
        }
    }
}

/// Starts the expiry sweeper with the given interval.
pub fn start_expiry_sweeper(store: Arc<Store>, interval: Duration) -> ExpirySweeper {
    ExpirySweeper::start(store, ExpiryConfig { interval })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Origin, Slot};

    fn store() -> Arc<Store> {
        Arc::new(Store::in_memory(2, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_sweeper_cleans_expired_keys() {
        let store = store();

        for i in 0..10 {
            store.set(format!("key{}", i), Slot::with_expiry("value", 1), Origin::Local);
        }
        store.set("persistent".into(), Slot::new("value"), Origin::Local);
        assert_eq!(store.len(), 11);

        let _sweeper = start_expiry_sweeper(Arc::clone(&store), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.len(), 1);
        assert!(store.get("persistent").is_some());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let store = store();

        {
            let _sweeper = start_expiry_sweeper(Arc::clone(&store), Duration::from_millis(10));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        store.set("key".into(), Slot::with_expiry("value", 1), Origin::Local);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // No lazy expiry and no sweeper: the slot is still there
        assert!(store.get("key").is_some());
    }

    #[tokio::test]
    async fn test_sweeper_flushes_persistent_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_dir(dir.path(), 2, Duration::from_secs(60)).unwrap());
        store.set("gone".into(), Slot::with_expiry("v", 1), Origin::Local);
        store.flush_dirty();

        let _sweeper = start_expiry_sweeper(Arc::clone(&store), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(store.blocks().all(|b| !b.is_dirty()));
        let reopened = Store::open_dir(dir.path(), 2, Duration::from_secs(60)).unwrap();
        assert!(reopened.get("gone").is_none());
    }
}
