//! Spool relay service
//!
//! Accepts files over HTTP, keeps them in a bounded on-disk spool and
//! relays them to an FTP endpoint, surviving endpoint outages and restarts.

use spool_relay::FtpConnector;
use spool_server::{start_server, AppContext, Config, Result, ServerError};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("spool_server=info".parse()?)
        .add_directive("spool_relay=info".parse()?)
        .add_directive("spool_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting spool relay...");

    // Load configuration from environment
    let config = Config::from_env()?;
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache_dir);
    info!(
        "Max cache size: {} MB",
        config.max_cache_size / (1024 * 1024)
    );
    info!("Remote: {}", config.remote);

    let connector = Arc::new(FtpConnector::new(config.remote.clone()));
    let ctx = AppContext::start(&config, connector).await?;

    let served = start_server(ctx.clone(), config.port, shutdown_signal()).await;
    ctx.shutdown().await;

    served.map_err(|e| ServerError::Config(format!("Server error: {}", e)))?;
    info!("Stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await
        }
    }
}
