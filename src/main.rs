use anyhow::Result;
use clap::Parser;
use quest_throttle::config::Config;
use quest_throttle::server::Server;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sliding-window admission control for the quest API
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Override BIND_ADDR
    #[arg(long)]
    bind_addr: Option<SocketAddr>,

    /// Override LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let mut config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(bind_addr) = cli.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("quest_throttle={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting quest-throttle");
    tracing::info!(
        "Configuration: bind_addr={}, redis_url={}, store_timeout_ms={}",
        config.bind_addr,
        config.redis_url,
        config.store_timeout_ms
    );

    let server = Server::new(config).map_err(|e| {
        tracing::error!(error = %e, "invalid configuration");
        anyhow::anyhow!("Failed to create server: {}", e)
    })?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
