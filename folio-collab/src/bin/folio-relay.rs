//! Folio relay server.
//!
//! Configuration comes from the environment:
//! - `FOLIO_BIND_ADDR`: listen address (default `127.0.0.1:9090`)
//! - `FOLIO_STORAGE_PATH`: RocksDB directory; unset keeps rooms in memory
//! - `RUST_LOG`: log filter for `env_logger`

use folio_collab::{ServerConfig, SyncServer};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting folio-relay on {} (storage: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "memory".to_string(), |p| p.display().to_string())
    );

    let server = SyncServer::new(config)?;
    server.run().await
}
