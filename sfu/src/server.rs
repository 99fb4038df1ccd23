//! Server lifecycle management

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::info;

use crate::http::{self, AppState};
use sfu_core::Config;

pub struct SfuServer {
    config: Config,
    state: AppState,
}

impl SfuServer {
    pub const fn new(config: Config, state: AppState) -> Self {
        Self { config, state }
    }

    pub async fn start(self) -> Result<()> {
        let address: SocketAddr = self
            .config
            .http_address()
            .parse()
            .context("invalid HTTP address")?;

        let router = http::create_router(self.state);

        let listener = tokio::net::TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;

        info!("SFU listening on {address}");

        axum::serve(listener, router).await?;
        Ok(())
    }
}
