//! Card Table Server
//!
//! Binds the WebSocket listener and serves tables until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use card_table::{
    network::{GameServer, ServerConfig},
    DECK_SIZE, HAND_SIZE, MAX_PLAYERS, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env().context("Failed to read configuration")?;

    info!("Card Table Server v{}", VERSION);
    info!("Seats: {} | Hand: {} | Deck: {}", MAX_PLAYERS, HAND_SIZE, DECK_SIZE);
    info!("Max connections: {}", config.max_connections);

    let server = Arc::new(GameServer::new(config));

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_server.shutdown(),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await.context("Server failed")?;

    info!("Server stopped");
    Ok(())
}
