//! Tandem sync server binary.
//!
//! Configuration comes from `TANDEM_*` environment variables (see
//! `ServerConfig::from_env`), plus:
//! - `TANDEM_DATA_DIR`: RocksDB directory (default `tandem_data`)
//! - `TANDEM_TOKENS_FILE`: JSON map of token → access grant
//!
//! Logging is controlled by `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use tandem_collab::{
    spawn_flusher, RocksStore, ServerConfig, SessionManager, StaticTokenAuthenticator,
    StoreConfig, SyncServer,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;

    let data_dir = std::env::var("TANDEM_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| StoreConfig::default().path);
    let store = RocksStore::open(StoreConfig {
        path: data_dir,
        ..StoreConfig::default()
    })?;
    info!("Document store opened at {}", store.path().display());

    let auth = match std::env::var("TANDEM_TOKENS_FILE") {
        Ok(path) => {
            let auth = StaticTokenAuthenticator::from_file(&path)?;
            info!("Loaded {} access tokens from {path}", auth.len());
            auth
        }
        Err(_) => {
            warn!("TANDEM_TOKENS_FILE not set; every attach will be rejected");
            StaticTokenAuthenticator::new()
        }
    };

    let manager = Arc::new(SessionManager::new(config, Arc::new(auth), Arc::new(store)));
    let flusher = spawn_flusher(manager.clone());

    let server = SyncServer::bind(manager.clone()).await?;
    let shutdown = server.shutdown_handle();
    info!("Tandem listening on {}", server.local_addr()?);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => warn!("Cannot listen for Ctrl-C ({e}); shutting down"),
        }
        shutdown.shutdown();
    });

    server.run().await?;

    let flushed = flusher.shutdown().await;
    let stats = manager.stats().await;
    info!(
        "Stopped: {flushed} documents flushed on exit, {} connections served, {} flush failures",
        stats.connections_total, stats.flush_failures
    );
    Ok(())
}
