//! Streaming TCP provider connection.
//!
//! Line protocol: the client opens with `<username>:<password>` and waits for
//! `AUTH SUCCESS` or `AUTH FAILED`, then sends `sub|<ENDPOINT>` and
//! `unsub|<ENDPOINT>`. The provider pushes one tick per line for every
//! subscribed endpoint over the same socket.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use ratefeed_common::CurrencyPair;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConnectionConfig, KIND_TCP};
use crate::connection::{Connection, ConnectionState, Session};
use crate::error::ConnectionError;
use crate::handler::ConnectionHandler;
use crate::mapper;
use crate::retry::{execute_with_retry, sleep_or_shutdown, ShutdownSignal};

type LineReader = BufReader<OwnedReadHalf>;

struct TcpInner {
    session: Session,
    /// Write half, shared by command senders.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Read half, parked here between the handshake and the first subscribe.
    reader: Mutex<Option<LineReader>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    endpoints: DashSet<String>,
}

/// Connection to a provider that pushes ticks over a persistent socket.
pub struct TcpConnection {
    inner: Arc<TcpInner>,
}

impl TcpConnection {
    /// Create a new TCP connection. Nothing is sent until [`Connection::connect`].
    pub fn new(
        config: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self, ConnectionError> {
        config.validate().map_err(ConnectionError::Configuration)?;

        Ok(Self {
            inner: Arc::new(TcpInner {
                session: Session::new(config, handler),
                writer: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
                reader_task: Mutex::new(None),
                endpoints: DashSet::new(),
            }),
        })
    }
}

impl TcpInner {
    /// Open the socket and run the credential handshake.
    async fn authenticate(&self) -> Result<(LineReader, OwnedWriteHalf), ConnectionError> {
        let config = self.session.config();
        let timeout = config.request_timeout();
        let target = config.target();

        let stream = time::timeout(timeout, TcpStream::connect((config.host.as_str(), config.port)))
            .await
            .map_err(|_| ConnectionError::Timeout(format!("connecting to {target}")))??;

        let (read_half, mut write_half) = stream.into_split();
        let auth = mapper::auth_line(&config.username, &config.password);
        write_half.write_all(format!("{auth}\n").as_bytes()).await?;

        let mut reader = BufReader::new(read_half);
        loop {
            let mut line = String::new();
            let read = time::timeout(timeout, reader.read_line(&mut line))
                .await
                .map_err(|_| ConnectionError::Timeout(format!("authentication reply from {target}")))??;

            if read == 0 {
                return Err(ConnectionError::Reset(format!(
                    "{target} closed the connection during authentication"
                )));
            }

            match line.trim() {
                mapper::AUTH_SUCCESS => return Ok((reader, write_half)),
                mapper::AUTH_FAILED => {
                    return Err(ConnectionError::BadCredentials {
                        provider: self.session.name().to_string(),
                    })
                }
                other => debug!(line = %other, "Skipping line before authentication reply"),
            }
        }
    }

    async fn send(&self, command: &str) -> Result<(), ConnectionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        writer.write_all(format!("{command}\n").as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Start the shared reader unless it is already running.
    fn ensure_reader(self: &Arc<Self>) {
        let mut task = self.reader_task.lock();
        if task.as_ref().map(|handle| !handle.is_finished()).unwrap_or(false) {
            return;
        }

        let parked = self.reader.lock().take();
        if let Some(reader) = parked {
            let signal = self.session.signal();
            *task = Some(tokio::spawn(Arc::clone(self).read_loop(reader, signal)));
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: LineReader, signal: ShutdownSignal) {
        let session = &self.session;
        let limit = session.config().request_retry_limit.max(1);
        let interval = session.config().request_interval();
        let target = session.config().target();
        let mut failures = 0u32;
        let mut seen = HashSet::new();
        let mut line = String::new();

        debug!(connection = %session.name(), "Reader started");

        while !signal.is_triggered() {
            line.clear();
            let result = tokio::select! {
                result = reader.read_line(&mut line) => result,
                _ = signal.triggered() => break,
            };

            // EOF is final, rereading a closed socket only returns EOF again
            let (err, closed) = match result {
                Ok(0) => (
                    ConnectionError::Reset(format!("{target} closed the stream")),
                    true,
                ),
                Ok(_) => {
                    failures = 0;
                    self.dispatch(line.trim(), &mut seen);
                    continue;
                }
                Err(e) => (ConnectionError::from(e), false),
            };

            failures += 1;
            warn!(connection = %session.name(), failures, limit, error = %err, "Read failed");

            if closed || failures >= limit {
                self.lost().await;
                session.report(
                    "read",
                    &target,
                    ConnectionError::ConnectionLost {
                        operation: "read".to_string(),
                        attempts: failures,
                    },
                    Some(err.to_string()),
                );
                break;
            }

            if sleep_or_shutdown(interval, &signal).await.is_err() {
                break;
            }
        }

        debug!(connection = %session.name(), "Reader stopped");
    }

    fn dispatch(&self, line: &str, seen: &mut HashSet<String>) {
        if line.is_empty() {
            return;
        }

        let name = self.session.name();
        let handler = self.session.handler();
        match mapper::parse_tcp_rate(self.session.provider(), line) {
            Ok(rate) => {
                if seen.insert(rate.pair.to_endpoint()) {
                    handler.on_rate_available(name, &rate.pair);
                }
                handler.on_rate_update(name, rate);
            }
            Err(err) => handler.on_rate_error(name, err),
        }
    }

    /// The stream died on its own: drop the transport without a disconnect callback.
    async fn lost(&self) {
        self.session.set_state(ConnectionState::Disconnected);
        self.writer.lock().await.take();
        self.endpoints.clear();
    }

    async fn release(&self) {
        let task = self.reader_task.lock().take();
        if let Some(handle) = task {
            handle.abort();
        }
        self.reader.lock().take();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(connection = %self.session.name(), error = %e, "Socket shutdown failed");
            }
        }

        self.endpoints.clear();
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn name(&self) -> &str {
        self.inner.session.name()
    }

    fn kind(&self) -> &'static str {
        KIND_TCP
    }

    fn state(&self) -> ConnectionState {
        self.inner.session.state()
    }

    fn active_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.inner.endpoints.iter().map(|e| e.key().clone()).collect();
        endpoints.sort();
        endpoints
    }

    #[instrument(skip(self), fields(connection = %self.name()))]
    async fn connect(&self) {
        let inner = &self.inner;
        let session = &inner.session;

        let Some(signal) = session.begin_connect() else {
            debug!(state = %session.state(), "Connect ignored");
            return;
        };

        let target = session.config().target();
        let attempts = session.config().health_retry_limit;
        info!(target = %target, attempts, "Authenticating with provider");

        let result = execute_with_retry(
            "connect",
            session.policy(attempts),
            &signal,
            || inner.authenticate(),
            |attempt, err| session.report_attempt("connect", &target, attempt, attempts, err),
        )
        .await;

        match result {
            Ok((reader, writer)) => {
                *inner.writer.lock().await = Some(writer);
                *inner.reader.lock() = Some(reader);

                if session.transition(ConnectionState::Connecting, ConnectionState::Connected) {
                    info!("Authenticated");
                    session.handler().on_connect(session.name());
                } else {
                    inner.release().await;
                }
            }
            Err(err) => session.connect_failed(&target, err),
        }
    }

    #[instrument(skip(self, rates), fields(connection = %self.name()))]
    async fn subscribe(&self, rates: &[CurrencyPair]) {
        let inner = &self.inner;
        let session = &inner.session;
        let target = session.config().target();

        let rates = session.config().effective_rates(rates);
        if rates.is_empty() {
            warn!("No rates to subscribe");
            return;
        }

        if !session.begin_subscribe() {
            session.report("subscribe", &target, ConnectionError::NotConnected, None);
            return;
        }

        inner.ensure_reader();

        for pair in rates {
            let endpoint = pair.to_endpoint();
            if inner.endpoints.contains(&endpoint) {
                debug!(endpoint = %endpoint, "Already streaming");
                continue;
            }

            match inner.send(&mapper::subscribe_command(&endpoint)).await {
                Ok(()) => {
                    inner.endpoints.insert(endpoint.clone());
                    info!(endpoint = %endpoint, "Subscribed");
                    session.handler().on_subscribe(session.name(), &endpoint);
                }
                Err(err) => session.report("subscribe", &target, err, Some(endpoint)),
            }
        }

        session.settle_subscriptions(!inner.endpoints.is_empty());
    }

    #[instrument(skip(self, rates), fields(connection = %self.name()))]
    async fn unsubscribe(&self, rates: &[CurrencyPair]) {
        let inner = &self.inner;
        let session = &inner.session;

        for pair in rates {
            let endpoint = pair.to_endpoint();
            if inner.endpoints.remove(&endpoint).is_none() {
                debug!(endpoint = %endpoint, "Endpoint was not subscribed");
                continue;
            }

            if let Err(err) = inner.send(&mapper::unsubscribe_command(&endpoint)).await {
                warn!(endpoint = %endpoint, error = %err, "Unsubscribe not sent, connection closed");
            }
            info!(endpoint = %endpoint, "Unsubscribed");
            session.handler().on_unsubscribe(session.name(), &endpoint);
        }

        if inner.endpoints.is_empty() {
            session.transition(ConnectionState::Streaming, ConnectionState::Connected);
        }
    }

    #[instrument(skip(self), fields(connection = %self.name()))]
    async fn disconnect(&self) {
        let session = &self.inner.session;
        let was_open = session.close();
        self.inner.release().await;

        if was_open {
            info!("Disconnected");
            session.handler().on_disconnect(session.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::recording::{Recorded, RecordingHandler};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Single-session provider that answers the handshake with `reply`
    /// and pushes one malformed line and two ticks per subscription.
    async fn provider(reply: &'static str) -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            write.write_all(b"Welcome to the rate feed\n").await.unwrap();

            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(line.clone());
                if let Some(endpoint) = line.strip_prefix("sub|") {
                    let ticks = format!(
                        "garbage\n\
                         name={endpoint}|bid=34.1|ask=34.9|timestamp=2024-12-16T10:15:30.250Z\n\
                         name={endpoint}|bid=34.2|ask=35.0|timestamp=2024-12-16T10:15:31Z\n"
                    );
                    write.write_all(ticks.as_bytes()).await.unwrap();
                } else if !line.contains('|') {
                    write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
                }
            }
        });

        (port, rx)
    }

    fn connection(port: u16) -> (TcpConnection, Arc<RecordingHandler>) {
        let config = ConnectionConfig::tcp("PF2", "127.0.0.1", port)
            .with_credentials("user", "pass")
            .with_retry_limits(2, 2)
            .with_request_interval(Duration::from_millis(10))
            .with_request_timeout(Duration::from_secs(2));
        let handler = Arc::new(RecordingHandler::default());
        let connection = TcpConnection::new(config, handler.clone()).unwrap();
        (connection, handler)
    }

    #[tokio::test]
    async fn test_auth_failed_is_one_fatal_error() {
        let (port, mut commands) = provider(mapper::AUTH_FAILED).await;
        let (connection, handler) = connection(port);

        connection.connect().await;

        assert_eq!(commands.recv().await.as_deref(), Some("user:pass"));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(handler.count(|e| matches!(e, Recorded::Connect)), 0);

        let errors = handler.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_fatal());
        assert!(matches!(errors[0].error, ConnectionError::BadCredentials { .. }));
        assert_eq!(errors[0].target, format!("127.0.0.1:{port}"));
    }

    #[tokio::test]
    async fn test_subscribe_streams_ticks() {
        let (port, mut commands) = provider(mapper::AUTH_SUCCESS).await;
        let (connection, handler) = connection(port);

        connection.connect().await;
        assert_eq!(connection.state(), ConnectionState::Connected);

        connection.subscribe(&[CurrencyPair::usd_try()]).await;
        assert_eq!(connection.state(), ConnectionState::Streaming);
        assert_eq!(connection.active_endpoints(), vec!["USDTRY".to_string()]);

        assert!(handler.wait_for(|events| {
            events.iter().filter(|e| matches!(e, Recorded::RateUpdate(_))).count() == 2
        }).await);

        let updates = handler.updates();
        assert_eq!(updates[0].pair, CurrencyPair::usd_try());
        assert_eq!(updates[0].provider.as_str(), "PF2");
        assert_eq!(updates[0].bid, 34.1);
        assert_eq!(
            updates[0].timestamp,
            Utc.with_ymd_and_hms(2024, 12, 16, 10, 15, 30).unwrap()
        );
        assert_eq!(updates[1].ask, 35.0);

        assert_eq!(handler.count(|e| matches!(e, Recorded::RateError(_))), 1);
        assert_eq!(handler.count(|e| matches!(e, Recorded::RateAvailable(_))), 1);
        assert!(handler.errors().is_empty());

        assert_eq!(commands.recv().await.as_deref(), Some("user:pass"));
        assert_eq!(commands.recv().await.as_deref(), Some("sub|USDTRY"));

        connection.unsubscribe(&[CurrencyPair::usd_try()]).await;
        assert_eq!(commands.recv().await.as_deref(), Some("unsub|USDTRY"));
        assert_eq!(connection.state(), ConnectionState::Connected);

        connection.disconnect().await;
        connection.disconnect().await;
        assert_eq!(handler.count(|e| matches!(e, Recorded::Disconnect)), 1);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_connect_exhausts_budget() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (connection, handler) = connection(port);

        connection.connect().await;

        let errors = handler.errors();
        assert_eq!(errors.len(), 3);
        assert!(errors[..2].iter().all(|s| s.error.is_retryable()));
        assert!(matches!(
            errors[2].error,
            ConnectionError::ConnectionLost { attempts: 2, .. }
        ));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_closed_stream_reports_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let _auth = lines.next_line().await;
            write.write_all(b"AUTH SUCCESS\n").await.unwrap();
            let _sub = lines.next_line().await;
            write
                .write_all(b"name=EURUSD|bid=1.02|ask=1.04|timestamp=2024-12-16T10:15:30Z\n")
                .await
                .unwrap();
            // Both halves dropped here, closing the socket
        });

        let (connection, handler) = connection(port);
        connection.connect().await;
        connection.subscribe(&["EUR_USD".parse().unwrap()]).await;

        assert!(handler.wait_for(|events| events.iter().any(|e| matches!(
            e,
            Recorded::ConnectionError(status)
                if matches!(status.error, ConnectionError::ConnectionLost { .. })
        ))).await);

        assert_eq!(handler.updates().len(), 1);
        let lost = handler.errors().pop().unwrap();
        assert_eq!(lost.operation, "read");
        // EOF ends the session on the first read, without spending the retry budget
        assert_eq!(
            lost.error,
            ConnectionError::ConnectionLost {
                operation: "read".to_string(),
                attempts: 1
            }
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(handler.count(|e| matches!(e, Recorded::Disconnect)), 0);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let (connection, handler) = connection(1);
        connection.subscribe(&[CurrencyPair::usd_try()]).await;

        let errors = handler.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error, ConnectionError::NotConnected);
    }
}
