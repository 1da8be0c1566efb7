// src/main.rs
use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use order_messaging::config::{self, CONFIG_FILE_NAME};
use order_messaging::MessagingService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("init-config") {
        let path = args
            .get(1)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        config::create_default_config_file(&path)?;
        println!("Configuration file created at: {}", path.display());
        println!("Review connection settings (uri, connect_attempts, rpc_timeout_ms) before use.");
        return Ok(());
    }

    let config = config::load_config().context("Failed to load configuration")?;

    let service = MessagingService::connect(&config)
        .await
        .context("Failed to connect to RabbitMQ")?;
    service
        .initialize()
        .await
        .context("Failed to initialize messaging")?;
    info!(
        reply_queue = service.reply_queue().unwrap_or_default(),
        "Order messaging ready. Press Ctrl-C to exit."
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    service.close().await?;
    Ok(())
}
