mod flood;
mod server;
mod ws;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use livecast_core::{
    bootstrap::{init_services, load_config},
    logging,
};
use livecast_sfu::LocalMediaEngine;

use server::LiveCastServer;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("LiveCast server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Media engine
    let engine = Arc::new(LocalMediaEngine::new(Arc::new(config.media.clone())));
    info!(
        codecs = config.media.media_codecs.len(),
        announced_ip = %config.media.advertised_ip(),
        "Media engine initialized"
    );

    // 4. Registries and services
    let services = init_services(&config, engine)?;

    // 5. Serve until shutdown
    LiveCastServer::new(config, services).start().await
}
