//! Resource cache reaper binary.

use anyhow::{Context, Result};
use clap::Parser;
use rescache_core::config::{LogConfig, LogFormat};
use rescache_metadata::{MetadataStore, ResourceCacheFactory};
use rescache_reaper::{Reaper, load_config};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Reclaims resource caches no build, resource, or job still needs.
#[derive(Parser, Debug)]
#[command(name = "rescache-reaper")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "RESCACHE_CONFIG",
        default_value = "config/rescache.toml"
    )]
    config: PathBuf,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| log.filter.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);
    match log.format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)?;
    init_tracing(&config.log);

    tracing::info!("rescache-reaper v{}", env!("CARGO_PKG_VERSION"));
    if args.config.exists() {
        tracing::info!(config_path = %args.config.display(), "Loaded configuration from file");
    } else {
        tracing::debug!("No config file found at {}", args.config.display());
    }

    let store = rescache_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    store
        .health_check()
        .await
        .context("metadata store health check failed")?;
    tracing::info!("Metadata store initialized");

    let reaper = Reaper::new(ResourceCacheFactory::new(store), config.gc);

    if args.once {
        let stats = reaper.run_cycle().await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    reaper.run(shutdown_signal()).await;
    Ok(())
}
