use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use evolu_core::Config;
use evolu_protocol::ReconcileConfig;
use evolu_store::{SqliteStore, StorageHandle};

/// Untrusted store-and-forward relay for Evolu replicas.
#[derive(Debug, Parser)]
#[command(name = "evolu-relay", version)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:4000")]
    listen: SocketAddr,

    /// Path of the relay database file.
    #[arg(long, default_value = "evolu-relay.db")]
    db: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let store = SqliteStore::open(&args.db, &Config::default())?;
    let storage = StorageHandle::spawn(store);

    let listener = TcpListener::bind(args.listen).await?;
    evolu_relay::serve(listener, storage, ReconcileConfig::default()).await?;
    Ok(())
}
