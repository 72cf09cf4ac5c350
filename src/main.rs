use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use upwatch::{api, AppConfig, StatusService};

#[derive(Debug, Parser)]
#[command(name = "upwatch", about = "HTTP endpoint uptime monitor")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()))
        .with_ansi(true)
        .init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    let api_port = config.api_port;

    let service = Arc::new(StatusService::from_config(config)?);

    let service_for_api = Arc::clone(&service);
    tokio::spawn(async move {
        if let Err(e) = api::start_server(api_port, service_for_api).await {
            tracing::error!("API server failed: {}", e);
        }
    });

    let engine = Arc::clone(&service);
    tokio::spawn(async move {
        engine.run().await;
    });

    signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping upwatch...");

    Ok(())
}
