mod http;
mod server;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use solocast_sfu::peer::WebRtcPeerFactory;
use solocast_sfu::{logging, Config, Registry};

use server::SolocastServer;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = Config::load()?;

    // 1.5. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!("configuration validation failed with {} error(s)", errors.len());
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Solocast server starting...");
    info!("HTTP address: {}", config.listen_addr());

    // 3. Wire the relay core: media engine factory + session registry
    let factory = Arc::new(WebRtcPeerFactory::new(config.webrtc.clone()));
    let registry = Registry::spawn(factory, config.webrtc.disconnect_grace());

    // 4. Serve until interrupted
    SolocastServer::new(config, registry).start().await
}
