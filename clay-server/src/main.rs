//! Clay session server.
//!
//! Configuration comes from `CLAY_*` environment variables (see
//! [`ServerConfig::from_env`]); logging is controlled with `RUST_LOG`.

use clay_collab::server::{ServerConfig, SyncServer};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    match &config.storage_path {
        Some(path) => info!("Starting clay server, persisting to {}", path.display()),
        None => info!("Starting clay server, in-memory storage"),
    }

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open mesh store: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    // Edits inside the debounce window have not reached the store yet
    server.engine().persist_all();
}
