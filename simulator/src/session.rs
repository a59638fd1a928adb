//! One simulated provider session over the TCP line protocol.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::rngs::StdRng;
use ratefeed_common::CurrencyPair;
use ratefeed_connection::mapper::{auth_line, AUTH_FAILED, AUTH_SUCCESS};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::FeedMetrics;
use crate::walk::RandomWalk;

const GREETING: &str = "Welcome to the RateFeed simulator";

/// Settings shared by every session.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub username: String,
    pub password: String,
    pub interval: Duration,
    pub volatility: f64,
}

/// Format one tick the way providers push them.
pub fn tick_line(endpoint: &str, bid: f64, ask: f64, timestamp: DateTime<Utc>) -> String {
    format!(
        "name={endpoint}|bid={bid:.5}|ask={ask:.5}|timestamp={}",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Apply one client command to the subscription set.
///
/// Returns an error line to send back for anything not understood.
pub fn apply_command(
    line: &str,
    walks: &mut BTreeMap<String, RandomWalk>,
    volatility: f64,
) -> Option<String> {
    let line = line.trim();
    let (verb, endpoint) = match line.split_once('|') {
        Some(parts) => parts,
        None => return Some(format!("ERROR|unknown command {line:?}")),
    };

    if let Err(e) = CurrencyPair::from_endpoint(endpoint) {
        return Some(format!("ERROR|{e}"));
    }

    match verb {
        "sub" => {
            walks
                .entry(endpoint.to_string())
                .or_insert_with(|| RandomWalk::new(endpoint, volatility));
            None
        }
        "unsub" => {
            walks.remove(endpoint);
            None
        }
        _ => Some(format!("ERROR|unknown command {line:?}")),
    }
}

/// Serve one client until it hangs up or fails authentication.
pub async fn serve<S>(
    stream: S,
    settings: Arc<FeedSettings>,
    mut rng: StdRng,
    metrics: Arc<FeedMetrics>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    metrics.session_opened();

    write_line(&mut write, GREETING).await?;

    let Some(credentials) = lines.next_line().await? else {
        return Ok(());
    };
    if credentials.trim() != auth_line(&settings.username, &settings.password) {
        metrics.auth_failed();
        warn!("Rejected credentials");
        write_line(&mut write, AUTH_FAILED).await?;
        return Ok(());
    }
    write_line(&mut write, AUTH_SUCCESS).await?;
    info!("Client authenticated");

    let mut walks = BTreeMap::new();
    let mut ticker = time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                debug!(command = %line, "Command received");
                if let Some(reply) = apply_command(&line, &mut walks, settings.volatility) {
                    metrics.command_rejected();
                    write_line(&mut write, &reply).await?;
                }
            }
            _ = ticker.tick() => {
                for (endpoint, walk) in walks.iter_mut() {
                    let (bid, ask) = walk.step(&mut rng);
                    write_line(&mut write, &tick_line(endpoint, bid, ask, Utc::now())).await?;
                    metrics.tick_sent();
                }
            }
        }
    }

    info!("Client disconnected");
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(write: &mut W, line: &str) -> std::io::Result<()> {
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use ratefeed_common::ProviderId;
    use ratefeed_connection::mapper::parse_tcp_rate;
    use tokio::io::{duplex, DuplexStream, Lines};

    fn settings() -> Arc<FeedSettings> {
        Arc::new(FeedSettings {
            username: "user".into(),
            password: "pass".into(),
            interval: Duration::from_millis(10),
            volatility: 0.001,
        })
    }

    type ClientLines = Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>;

    fn start(metrics: Arc<FeedMetrics>) -> (ClientLines, tokio::io::WriteHalf<DuplexStream>) {
        let (client, server) = duplex(4096);
        tokio::spawn(serve(server, settings(), StdRng::seed_from_u64(3), metrics));
        let (read, write) = tokio::io::split(client);
        (BufReader::new(read).lines(), write)
    }

    #[test]
    fn test_tick_line_parses_as_provider_tick() {
        let timestamp = "2024-12-16T10:15:30.250Z".parse::<DateTime<Utc>>().unwrap();
        let line = tick_line("EURUSD", 1.0812, 1.0834, timestamp);
        assert_eq!(
            line,
            "name=EURUSD|bid=1.08120|ask=1.08340|timestamp=2024-12-16T10:15:30.250Z"
        );

        let rate = parse_tcp_rate(&ProviderId::new("SIM"), &line).unwrap();
        assert_eq!(rate.pair, "EUR_USD".parse().unwrap());
        assert_eq!(rate.bid, 1.0812);
    }

    #[test]
    fn test_commands() {
        let mut walks = BTreeMap::new();

        assert_eq!(apply_command("sub|USDTRY", &mut walks, 0.0), None);
        assert_eq!(apply_command("sub|USDTRY", &mut walks, 0.0), None);
        assert_eq!(walks.len(), 1);

        assert!(apply_command("sub|usdtry", &mut walks, 0.0).is_some());
        assert!(apply_command("list", &mut walks, 0.0).is_some());
        assert!(apply_command("pause|USDTRY", &mut walks, 0.0).is_some());

        assert_eq!(apply_command("unsub|USDTRY", &mut walks, 0.0), None);
        assert!(walks.is_empty());
    }

    #[tokio::test]
    async fn test_session_streams_subscribed_endpoints() {
        let metrics = Arc::new(FeedMetrics::new());
        let (mut lines, mut write) = start(metrics.clone());

        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(GREETING));
        write.write_all(b"user:pass\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(AUTH_SUCCESS));

        write.write_all(b"sub|USDTRY\n").await.unwrap();
        let tick = lines.next_line().await.unwrap().unwrap();
        let rate = parse_tcp_rate(&ProviderId::new("SIM"), &tick).unwrap();
        assert_eq!(rate.pair, CurrencyPair::usd_try());
        assert!(rate.bid < rate.ask);

        write.write_all(b"sub|EUR\n").await.unwrap();
        let mut rejected = false;
        for _ in 0..20 {
            let line = lines.next_line().await.unwrap().unwrap();
            if line.starts_with("ERROR|") {
                rejected = true;
                break;
            }
        }
        assert!(rejected);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions, 1);
        assert_eq!(snapshot.rejected_commands, 1);
        assert!(snapshot.ticks_sent >= 1);
    }

    #[tokio::test]
    async fn test_session_rejects_bad_credentials() {
        let metrics = Arc::new(FeedMetrics::new());
        let (mut lines, mut write) = start(metrics.clone());

        lines.next_line().await.unwrap();
        write.write_all(b"user:wrong\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(AUTH_FAILED));
        assert_eq!(lines.next_line().await.unwrap(), None);
        assert_eq!(metrics.snapshot().auth_failures, 1);
    }
}
