//! RateFeed Simulator
//!
//! TCP rate provider for developing and testing against the coordinator
//! without a real market-data feed.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;
use tracing::{info, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod metrics;
mod session;
mod walk;

use metrics::FeedMetrics;
use session::FeedSettings;

/// RateFeed Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "feed-simulator")]
#[command(about = "Simulated TCP rate provider")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8081")]
    port: u16,

    /// Accepted username
    #[arg(long, default_value = "user")]
    username: String,

    /// Accepted password
    #[arg(long, default_value = "pass")]
    password: String,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Milliseconds between ticks of each subscribed endpoint
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Maximum relative mid move per tick
    #[arg(long, default_value = "0.001")]
    volatility: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if !(0.0..1.0).contains(&args.volatility) {
        anyhow::bail!("Volatility must be in [0, 1), got {}", args.volatility);
    }
    if args.interval_ms == 0 {
        anyhow::bail!("Tick interval must be positive");
    }

    let settings = Arc::new(FeedSettings {
        username: args.username,
        password: args.password,
        interval: Duration::from_millis(args.interval_ms),
        volatility: args.volatility,
    });
    let metrics = Arc::new(FeedMetrics::new());

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(
        port = args.port,
        interval_ms = args.interval_ms,
        volatility = args.volatility,
        "Starting RateFeed Simulator"
    );

    let mut session_no: u64 = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                session_no += 1;

                // Each session walks independently but reproducibly
                let rng = match args.seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(session_no)),
                    None => StdRng::from_entropy(),
                };

                let span = tracing::info_span!("session", id = session_no, peer = %peer);
                let settings = settings.clone();
                let metrics = metrics.clone();
                tokio::spawn(
                    async move {
                        if let Err(e) = session::serve(socket, settings, rng, metrics).await {
                            warn!(error = %e, "Session ended with error");
                        }
                    }
                    .instrument(span),
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let snapshot = metrics.snapshot();
    info!("Simulation complete");
    info!("Sessions: {}", snapshot.sessions);
    info!("Rejected logins: {}", snapshot.auth_failures);
    info!("Ticks sent: {}", snapshot.ticks_sent);
    info!("Rejected commands: {}", snapshot.rejected_commands);

    Ok(())
}
