use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lora_joinserver::config::Config;
use lora_joinserver::joinserver::JoinServer;
use lora_joinserver::server;
use lora_joinserver::store::ConfigStore;

#[derive(Parser)]
#[command(name = "lora-joinserver")]
#[command(about = "LoRaWAN join server for the Backend Interfaces join procedures")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lora-joinserver v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "{} device(s), {} KEK(s) provisioned",
        config.devices.len(),
        config.keks.len()
    );

    let store = ConfigStore::from_config(&config)?;
    let join_server = Arc::new(JoinServer::new(store));

    server::serve(&config.http.bind, join_server).await
}
