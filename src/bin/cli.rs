//! blockkv CLI Client
//!
//! Command-line interface for interacting with a blockkv node.

use anyhow::Context;
use blockkv::client::Client;
use clap::{Parser, Subcommand};

/// blockkv CLI
#[derive(Parser, Debug)]
#[command(name = "blockkv-cli")]
#[command(about = "CLI for the blockkv key-value store")]
#[command(version)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = blockkv::DEFAULT_LISTEN_ADDR)]
    server: String,

    /// Shared secret to AUTH with
    #[arg(long)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,

        /// Expire the key after this many seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// List keys starting with a prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Count keys starting with a prefix
    Count {
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Ping the server
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut client = Client::connect(&args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    if let Some(secret) = &args.secret {
        client.auth(secret).await.context("authentication failed")?;
    }

    match args.command {
        Commands::Get { key } => match client.get(&key).await? {
            Some(slot) => {
                println!("{}", String::from_utf8_lossy(&slot.value));
                if slot.expires != 0 {
                    println!("(expires at {})", slot.expires);
                }
            }
            None => println!("(nil)"),
        },
        Commands::Set { key, value, ttl } => {
            let expires = ttl.map_or(0, |secs| blockkv::storage::unix_now() + secs);
            client.set(&key, value, expires).await?;
            println!("OK");
        }
        Commands::Del { key } => {
            client.del(&key).await?;
            println!("OK");
        }
        Commands::List { prefix } => {
            let keys = client.list(&prefix).await?;
            for (i, key) in keys.iter().enumerate() {
                println!("{}) {}", i + 1, key);
            }
            if keys.is_empty() {
                println!("(empty)");
            }
        }
        Commands::Count { prefix } => {
            println!("{}", client.count(&prefix).await?);
        }
        Commands::Ping => {
            client.ping().await?;
            println!("PONG");
        }
    }

    client.close().await?;
    Ok(())
}
