//! Duel Arena Server
//!
//! Authoritative WebSocket server for stake-based rock/paper/scissors
//! duels: matchmaking, escrow, adaptive bot opponents, persisted
//! progression.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use duel_arena::store::MemoryStore;
use duel_arena::{DuelServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = ServerConfig::default();
    info!("Duel Arena Server v{}", VERSION);
    info!("Listening on {}", config.bind_addr);

    // The persistence backend is swappable behind ProfileStore; the
    // in-memory store keeps a single-node deployment self-contained.
    let store = Arc::new(MemoryStore::new());
    let server = Arc::new(DuelServer::new(config, store));

    let shutdown_handle = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown_handle.shutdown();
        }
    });

    server.run().await.context("Server failed")?;
    Ok(())
}
