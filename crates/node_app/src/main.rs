use std::path::Path;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use node_app::{NodeConfig, CONFIG_FILE};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = NodeConfig::load(Path::new(CONFIG_FILE))?;
    tracing::info!("api_port   = {}", config.api_port);
    tracing::info!("relay_port = {}", config.relay_port);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            on_signal.cancel();
        }
    });

    // Losing the relay is terminal for a client; there is no reconnect.
    if let Err(e) = node_app::run(config, cancel).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}
