mod http;
mod rtc;
mod server;

use anyhow::Result;
use tracing::info;

use http::AppState;
use server::SfuServer;
use sfu_core::logging;
use sfu_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    logging::init_logging(&config.logging)?;

    info!("SFU starting...");
    info!("HTTP address: {}", config.http_address());

    let state = AppState::new(config.webrtc.clone());
    SfuServer::new(config, state).start().await
}
