//! blockkv - A Partitioned Key-Value Store
//!
//! This is the main entry point for the blockkv server.
//! It opens the store, starts the background tasks, wires up replication
//! and serves client connections until Ctrl+C.

use anyhow::Context;
use blockkv::commands::CommandHandler;
use blockkv::connection::{serve, ConnectionSettings, ConnectionStats};
use blockkv::replication::{Primary, Replica, StateSaver, DEFAULT_SAVE_INTERVAL};
use blockkv::storage::{start_expiry_sweeper, Flusher, Store};
use blockkv::{Config, Replication};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// blockkv server
#[derive(Parser, Debug)]
#[command(name = "blockkv")]
#[command(about = "Partitioned key-value store with primary-to-replica streaming")]
#[command(version)]
struct Args {
    /// Client listen address (host:port)
    #[arg(short, long, default_value = blockkv::DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Shared secret clients and replicas must AUTH with
    #[arg(long)]
    secret: Option<String>,

    /// Parts, and blocks per part
    #[arg(short, long, default_value_t = blockkv::DEFAULT_SHARDS)]
    shards: usize,

    /// Persist blocks in this directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Largest accepted frame in bytes
    #[arg(long, default_value_t = blockkv::DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// Per-read timeout in milliseconds
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Seconds between flushes of dirty blocks
    #[arg(long, default_value_t = 10)]
    flush_secs: u64,

    /// Seconds between expiry sweeps
    #[arg(long, default_value_t = 30)]
    sweep_secs: u64,

    /// Seconds a deleted key lingers as a tombstone
    #[arg(long, default_value_t = 60)]
    delete_grace_secs: u64,

    /// Serve an op stream to replicas on this address
    #[arg(
        long,
        conflicts_with = "replica_of",
        num_args = 0..=1,
        default_missing_value = blockkv::DEFAULT_REPL_ADDR
    )]
    primary_listen: Option<String>,

    /// Ops buffered per replica
    #[arg(long, default_value_t = blockkv::config::DEFAULT_REPL_BUFFER)]
    repl_buffer: usize,

    /// Follow the primary listening on this address (needs --data-dir)
    #[arg(long)]
    replica_of: Option<String>,
}

impl Args {
    fn into_config(self) -> Config {
        let mut builder = Config::builder()
            .listen_addr(self.listen)
            .shards(self.shards)
            .max_message_size(self.max_message_size)
            .flush_interval(Duration::from_secs(self.flush_secs))
            .sweep_interval(Duration::from_secs(self.sweep_secs))
            .delete_grace(Duration::from_secs(self.delete_grace_secs));

        if let Some(secret) = self.secret {
            builder = builder.auth_secret(secret);
        }
        if let Some(ms) = self.read_timeout_ms {
            builder = builder.read_timeout(Duration::from_millis(ms));
        }
        if let Some(dir) = self.data_dir {
            builder = builder.persist(dir);
        }
        if let Some(addr) = self.primary_listen {
            builder = builder.primary(addr, self.repl_buffer);
        }
        if let Some(addr) = self.replica_of {
            builder = builder.replica_of(addr);
        }

        builder.build()
    }
}

fn print_banner(config: &Config, store: &Store) {
    let role = match &config.replication {
        Replication::Disabled => "standalone".to_string(),
        Replication::Primary { listen_addr, .. } => format!("primary (replicas on {})", listen_addr),
        Replication::Replica { primary_addr, .. } => format!("replica of {}", primary_addr),
    };
    let storage = if config.persist {
        config.data_dir.display().to_string()
    } else {
        "memory only".to_string()
    };

    println!(
        r#"
blockkv v{} - Partitioned Key-Value Store
──────────────────────────────────────────────────────────────
Listening on   {}
Shards         {} parts x {} blocks
Storage        {}
Role           {}

Use Ctrl+C to shutdown gracefully.
"#,
        blockkv::VERSION,
        config.listen_addr,
        store.part_count(),
        config.shards,
        storage,
        role
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = Args::parse().into_config();
    config.validate().context("invalid configuration")?;

    let store = Arc::new(Store::open(&config).context("failed to open store")?);
    info!(
        blocks = store.block_count(),
        keys = store.len(),
        persistent = store.is_persistent(),
        "Store opened"
    );

    let _sweeper = start_expiry_sweeper(Arc::clone(&store), config.sweep_interval);
    let flusher = config
        .persist
        .then(|| Flusher::start(Arc::clone(&store), config.flush_interval));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let settings = Arc::new(ConnectionSettings::from(&config));
    let mut background = Vec::new();
    let mut saver = None;

    match &config.replication {
        Replication::Disabled => {}
        Replication::Primary {
            listen_addr,
            buffer_size,
        } => {
            let primary = Primary::start(Arc::clone(&store), *buffer_size)?;
            let listener = TcpListener::bind(listen_addr)
                .await
                .with_context(|| format!("failed to bind replication listener on {}", listen_addr))?;
            info!(addr = %listen_addr, primary = %primary.id(), "Replication listener ready");
            background.push(tokio::spawn(primary.serve(
                listener,
                Arc::clone(&settings),
                shutdown_rx.clone(),
            )));
        }
        Replication::Replica { .. } => {
            let replica = Replica::from_config(Arc::clone(&store), &config)?;
            saver = Some(StateSaver::start(Arc::clone(&replica), DEFAULT_SAVE_INTERVAL));
            background.push(tokio::spawn(replica.run(shutdown_rx.clone())));
        }
    }

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    print_banner(&config, &store);

    let stats = Arc::new(ConnectionStats::new());
    let server = tokio::spawn(serve(
        listener,
        CommandHandler::new(Arc::clone(&store), config.list_buffer),
        settings,
        Arc::clone(&stats),
        shutdown_rx,
    ));

    signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("Shutdown signal received, stopping server...");

    let _ = shutdown_tx.send(true);
    server.await?;
    for task in background {
        task.await?;
    }
    drop(saver);
    drop(flusher);

    if config.persist {
        let store = Arc::clone(&store);
        let flushed = tokio::task::spawn_blocking(move || store.flush_dirty()).await?;
        info!(blocks = flushed, "Final flush complete");
    }

    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        requests = stats.commands_processed.load(Ordering::Relaxed),
        "Server shutdown complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_listen_defaults_to_repl_addr() {
        let args = Args::try_parse_from(["blockkv", "--primary-listen"]).unwrap();
        assert_eq!(args.primary_listen.as_deref(), Some(blockkv::DEFAULT_REPL_ADDR));

        let args = Args::try_parse_from(["blockkv", "--primary-listen", "0.0.0.0:9000"]).unwrap();
        assert_eq!(args.primary_listen.as_deref(), Some("0.0.0.0:9000"));

        let args = Args::try_parse_from(["blockkv"]).unwrap();
        assert!(args.primary_listen.is_none());
        assert!(matches!(args.into_config().replication, Replication::Disabled));
    }
}
