use anyhow::Result;
use heatwatch::app::AppContext;
use heatwatch::config::Config;
use heatwatch::logging::init_logging;
use heatwatch::web;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = Config::locate().unwrap_or_else(|| PathBuf::from("heatwatch.yaml"));
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config: {}", e))?;
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    info!("Heatwatch {} starting up", env!("APP_VERSION"));

    let host = config.web.host.clone();
    let port = config.web.port;
    let ctx = Arc::new(
        AppContext::connect(config)
            .map_err(|e| anyhow::anyhow!("Failed to start: {}", e))?
            .with_config_path(config_path),
    );

    let collector = ctx.collector.clone().start();

    let served = web::serve(ctx.clone(), &host, port, shutdown_signal()).await;
    if let Err(e) = &served {
        error!("Web server error: {}", e);
    }

    if let Err(e) = collector.stop().await {
        error!("{}", e);
    }
    ctx.mqtt.shutdown().await;
    info!("Shutdown complete");
    served
}
