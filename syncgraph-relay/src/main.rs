//! Standalone relay: orders and fans out operation batches per document and
//! appends them to a document store.
//!
//! Configuration comes from the environment:
//!
//! - `SYNCGRAPH_BIND`: listen address (default `127.0.0.1:9090`)
//! - `SYNCGRAPH_DATA`: RocksDB directory; without it batches are kept in memory
//! - `SYNCGRAPH_MAX_PEERS`: peers per document room (default 100)
//! - `RUST_LOG`: log filter for `env_logger`

use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use syncgraph_collab::{MemoryStore, ServerConfig, SyncServer};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
struct RelaySettings {
    bind_addr: String,
    data_dir: Option<PathBuf>,
    max_peers: usize,
}

impl RelaySettings {
    fn from_env() -> Self {
        let defaults = ServerConfig::default();
        let max_peers = match std::env::var("SYNCGRAPH_MAX_PEERS") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("ignoring SYNCGRAPH_MAX_PEERS={raw}, not a number");
                defaults.max_peers_per_room
            }),
            Err(_) => defaults.max_peers_per_room,
        };
        Self {
            bind_addr: std::env::var("SYNCGRAPH_BIND").unwrap_or(defaults.bind_addr),
            data_dir: std::env::var_os("SYNCGRAPH_DATA").map(PathBuf::from),
            max_peers,
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            max_peers_per_room: self.max_peers,
            storage_path: self.data_dir.clone(),
            ..ServerConfig::default()
        }
    }
}

fn build_server(settings: &RelaySettings) -> Result<SyncServer, BoxError> {
    let config = settings.server_config();
    match &settings.data_dir {
        Some(dir) => {
            info!("persisting documents to {}", dir.display());
            Ok(SyncServer::new(config)?)
        }
        None => {
            warn!("SYNCGRAPH_DATA not set, documents are kept in memory only");
            Ok(SyncServer::with_store(config, Arc::new(MemoryStore::new())))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let settings = RelaySettings::from_env();
    info!("Starting syncgraph relay on {}...", settings.bind_addr);
    let server = build_server(&settings)?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("relay stopped: {e}");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "shutting down after {} connections, {} batches relayed",
                stats.total_connections, stats.relayed_batches
            );
            Ok(())
        }
    }
}
