use anyhow::Context;
use clap::Parser;
use tracing::info;

use rvoip_infra_common::{log_welcome, setup_logging};
use rvoip_kurento_client::KurentoClient;
use rvoip_signaling_server::{Cli, ServerConfig, SignalingServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::resolve(&cli)?;

    setup_logging(&config.logging)?;
    log_welcome(&config.logging.app_name, env!("CARGO_PKG_VERSION"));
    info!("Media topology: {:?}", config.broker.topology);

    let kurento = KurentoClient::connect(config.kurento.clone())
        .await
        .with_context(|| format!("connecting to media server at {}", config.kurento.url))?;

    let server = SignalingServer::new(config, kurento);
    let listener = server.bind().await?;
    server.run(listener, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown requested");
    }
}
