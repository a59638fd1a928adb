//! RateFeed Coordinator Binary
//!
//! Connects to the configured rate providers and publishes derived rates.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratefeed_common::parse_rate_list;
use ratefeed_connection::ConnectionRegistry;
use ratefeed_coordinator::{ConfigError, Coordinator, CoordinatorConfig, LoggingAlerter};
use ratefeed_fx::{build_calculator, InMemoryRateCache, LoggingErrorHandler, RateManager, TracingPublisher};

/// RateFeed coordinator CLI
#[derive(Parser, Debug)]
#[command(name = "coordinator")]
#[command(about = "Aggregates provider FX rates and publishes derived cross rates")]
struct Args {
    /// JSON configuration file (defaults to the environment)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma separated rate types, overriding the configuration
    #[arg(short, long)]
    rates: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_file(path)?,
        None => CoordinatorConfig::from_env()?,
    };
    if let Some(rates) = &args.rates {
        config.rates = parse_rate_list(rates)?;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting RateFeed Coordinator");

    if let Err(e) = config.validate().map_err(ConfigError::Invalid) {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    let manager = RateManager::new(
        Arc::new(InMemoryRateCache::new()),
        build_calculator(&config.calculator),
        Arc::new(TracingPublisher),
    )
    .with_error_handler(Arc::new(LoggingErrorHandler));

    let coordinator = Coordinator::new(
        config.clone(),
        &ConnectionRegistry::with_defaults(),
        Arc::new(manager),
        Arc::new(LoggingAlerter),
    );

    coordinator.start().await?;

    info!(
        node_id = %coordinator.node_id(),
        rates = config.rates.len(),
        connections = coordinator.subscribers().len(),
        "Coordinator running"
    );

    // Keep running until shutdown
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    coordinator.stop().await?;

    info!(metrics = %coordinator.metrics().to_prometheus(), "Coordinator shutdown complete");
    Ok(())
}
