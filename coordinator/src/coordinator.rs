//! Core coordinator implementation.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use ratefeed_common::{CurrencyPair, RateParseError, RawRate};
use ratefeed_connection::{
    ConnectionError, ConnectionHandler, ConnectionRegistry, ConnectionState, ConnectionStatus,
    SharedConnection,
};
use ratefeed_fx::RateManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::alert::{Alert, Alerter};
use crate::config::CoordinatorConfig;
use crate::dispatcher::RateDispatcher;
use crate::error::{CoordinatorError, Result};
use crate::metrics::{Metrics, SharedMetrics};
use crate::state::CoordinatorState;

/// Connection callback, as queued for the event loop.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { name: String },
    Disconnected { name: String },
    Subscribed { name: String, endpoint: String },
    Unsubscribed { name: String, endpoint: String },
    RateAvailable { name: String, pair: CurrencyPair },
    RateUpdate { name: String, rate: RawRate },
    RateError { name: String, error: RateParseError },
    ConnectionError { name: String, status: ConnectionStatus },
}

/// Handler shared by every connection. Forwards callbacks into one channel,
/// preserving the order each connection emitted them in.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ConnectionEvent) {
        // Closed once the coordinator has stopped
        let _ = self.tx.send(event);
    }
}

impl ConnectionHandler for ChannelHandler {
    fn on_connect(&self, name: &str) {
        self.forward(ConnectionEvent::Connected { name: name.to_string() });
    }

    fn on_disconnect(&self, name: &str) {
        self.forward(ConnectionEvent::Disconnected { name: name.to_string() });
    }

    fn on_subscribe(&self, name: &str, endpoint: &str) {
        self.forward(ConnectionEvent::Subscribed {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
        });
    }

    fn on_unsubscribe(&self, name: &str, endpoint: &str) {
        self.forward(ConnectionEvent::Unsubscribed {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
        });
    }

    fn on_rate_available(&self, name: &str, pair: &CurrencyPair) {
        self.forward(ConnectionEvent::RateAvailable {
            name: name.to_string(),
            pair: pair.clone(),
        });
    }

    fn on_rate_update(&self, name: &str, rate: RawRate) {
        self.forward(ConnectionEvent::RateUpdate { name: name.to_string(), rate });
    }

    fn on_rate_error(&self, name: &str, error: RateParseError) {
        self.forward(ConnectionEvent::RateError { name: name.to_string(), error });
    }

    fn on_connection_error(&self, name: &str, status: ConnectionStatus) {
        self.forward(ConnectionEvent::ConnectionError { name: name.to_string(), status });
    }
}

/// Synchronous answer to an operator command. The work itself runs in the
/// background and reports through the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAck {
    Accepted(String),
    UnknownSubscriber(String),
    NotRunning(String),
}

impl CommandAck {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandAck::Accepted(_))
    }

    pub fn message(&self) -> &str {
        match self {
            CommandAck::Accepted(m) | CommandAck::UnknownSubscriber(m) | CommandAck::NotRunning(m) => m,
        }
    }
}

/// Operator view of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberStatus {
    pub name: String,
    pub kind: &'static str,
    pub state: ConnectionState,
    pub endpoints: Vec<String>,
}

/// State shared with the event loop and background commands.
struct CoordinatorInner {
    rates: Vec<CurrencyPair>,
    reconnect_on_loss: bool,
    connections: DashMap<String, SharedConnection>,
    dispatcher: RateDispatcher,
    alerter: Arc<dyn Alerter>,
    metrics: SharedMetrics,
}

/// Owns the provider connections and routes their rates into the engine.
///
/// Holds no aggregation logic of its own.
pub struct Coordinator {
    node_id: String,
    state: RwLock<CoordinatorState>,
    inner: Arc<CoordinatorInner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Mutex<Option<mpsc::Receiver<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Create a coordinator with one connection per enabled provider.
    ///
    /// A provider whose connection cannot be built is logged and skipped.
    pub fn new(
        config: CoordinatorConfig,
        registry: &ConnectionRegistry,
        manager: Arc<RateManager>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| format!("coordinator-{}", uuid::Uuid::new_v4()));

        let (handler, events_rx) = ChannelHandler::new();
        let handler: Arc<dyn ConnectionHandler> = Arc::new(handler);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let connections = DashMap::new();
        for connection_config in config.enabled_connections() {
            let name = connection_config.name.clone();
            match registry.create(connection_config.clone(), handler.clone()) {
                Ok(connection) => {
                    debug!(connection = %name, kind = connection.kind(), "Connection created");
                    connections.insert(name, connection);
                }
                Err(e) => {
                    error!(connection = %name, error = %e, "Cannot create connection, skipping");
                }
            }
        }

        let metrics: SharedMetrics = Arc::new(Metrics::new());

        Self {
            node_id,
            state: RwLock::new(CoordinatorState::Starting),
            inner: Arc::new(CoordinatorInner {
                rates: config.rates,
                reconnect_on_loss: config.reconnect_on_loss,
                connections,
                dispatcher: RateDispatcher::new(manager, metrics.clone()),
                alerter,
                metrics,
            }),
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            event_loop: Mutex::new(None),
        }
    }

    /// Start the event loop and connect every provider.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != CoordinatorState::Starting {
                return Err(CoordinatorError::InvalidState {
                    operation: "start",
                    state: *state,
                });
            }
            *state = CoordinatorState::Running;
        }

        let events = self.events_rx.lock().take();
        let shutdown = self.shutdown_rx.lock().take();
        if let (Some(events), Some(shutdown)) = (events, shutdown) {
            let inner = self.inner.clone();
            *self.event_loop.lock() = Some(tokio::spawn(run_event_loop(inner, events, shutdown)));
        }

        info!(connections = self.inner.connections.len(), "Coordinator started");

        for entry in self.inner.connections.iter() {
            let connection = entry.value().clone();
            tokio::spawn(async move { connection.connect().await });
        }

        Ok(())
    }

    /// Disconnect every provider, drain queued rates and stop.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.is_terminal() {
                return Ok(());
            }
            *state = CoordinatorState::ShuttingDown;
        }
        info!("Stopping coordinator");

        let connections: Vec<SharedConnection> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in connections {
            connection.disconnect().await;
        }

        let _ = self.shutdown_tx.send(()).await;
        let event_loop = self.event_loop.lock().take();
        if let Some(handle) = event_loop {
            if let Err(e) = handle.await {
                error!(error = %e, "Event loop panicked");
            }
        }

        self.inner.dispatcher.shutdown().await;
        self.inner.update_active_gauge();

        *self.state.write() = CoordinatorState::Stopped;
        info!("Coordinator stopped");
        Ok(())
    }

    /// Status of every connection, sorted by name.
    pub fn subscribers(&self) -> Vec<SubscriberStatus> {
        let mut subscribers: Vec<SubscriberStatus> = self
            .inner
            .connections
            .iter()
            .map(|entry| {
                let connection = entry.value();
                SubscriberStatus {
                    name: connection.name().to_string(),
                    kind: connection.kind(),
                    state: connection.state(),
                    endpoints: connection.active_endpoints(),
                }
            })
            .collect();
        subscribers.sort_by(|a, b| a.name.cmp(&b.name));
        subscribers
    }

    pub fn connect(&self, name: &str) -> CommandAck {
        self.command(name, "Connecting", |connection| async move {
            connection.connect().await
        })
    }

    pub fn disconnect(&self, name: &str) -> CommandAck {
        self.command(name, "Disconnecting", |connection| async move {
            connection.disconnect().await
        })
    }

    pub fn subscribe(&self, name: &str, rates: Vec<CurrencyPair>) -> CommandAck {
        self.command(name, "Subscribing", |connection| async move {
            connection.subscribe(&rates).await
        })
    }

    pub fn unsubscribe(&self, name: &str, rates: Vec<CurrencyPair>) -> CommandAck {
        self.command(name, "Unsubscribing", |connection| async move {
            connection.unsubscribe(&rates).await
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_operational()
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.inner.metrics.clone()
    }

    /// Look up `name` and run `work` against it in the background.
    fn command<F, Fut>(&self, name: &str, verb: &str, work: F) -> CommandAck
    where
        F: FnOnce(SharedConnection) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let state = self.state();
        if !state.accepts_commands() {
            return CommandAck::NotRunning(format!("Coordinator is {state:?}"));
        }

        let Some(connection) = self.inner.connection(name) else {
            return CommandAck::UnknownSubscriber(format!("No subscriber named {name}"));
        };

        tokio::spawn(work(connection));
        CommandAck::Accepted(format!("{verb} {name}"))
    }
}

async fn run_event_loop(
    inner: Arc<CoordinatorInner>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut shutdown: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("Event loop shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => inner.handle(event),
                None => break,
            },
        }
    }
}

impl CoordinatorInner {
    fn connection(&self, name: &str) -> Option<SharedConnection> {
        self.connections.get(name).map(|entry| entry.value().clone())
    }

    fn handle(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { name } => {
                info!(connection = %name, "Provider connected, subscribing");
                if let Some(connection) = self.connection(&name) {
                    let rates = self.rates.clone();
                    tokio::spawn(async move { connection.subscribe(&rates).await });
                }
            }
            ConnectionEvent::Disconnected { name } => {
                info!(connection = %name, "Provider disconnected");
            }
            ConnectionEvent::Subscribed { name, endpoint } => {
                info!(connection = %name, endpoint = %endpoint, "Subscribed");
            }
            ConnectionEvent::Unsubscribed { name, endpoint } => {
                info!(connection = %name, endpoint = %endpoint, "Unsubscribed");
            }
            ConnectionEvent::RateAvailable { name, pair } => {
                info!(connection = %name, pair = %pair, "Rate available");
            }
            ConnectionEvent::RateUpdate { rate, .. } => {
                self.metrics.rate_received();
                self.dispatcher.dispatch(rate);
            }
            ConnectionEvent::RateError { name, error } => {
                self.metrics.parse_error();
                warn!(connection = %name, code = error.error_code(), error = %error, "Discarding rate payload");
            }
            ConnectionEvent::ConnectionError { name, status } => {
                self.connection_error(&name, status);
            }
        }
        self.update_active_gauge();
    }

    fn connection_error(&self, name: &str, status: ConnectionStatus) {
        self.metrics.connection_error();
        if status.is_fatal() {
            error!(connection = %name, code = status.error.error_code(), "{}", status);
        } else {
            warn!(connection = %name, code = status.error.error_code(), "{}", status);
        }

        if let Some(alert) = Alert::for_status(&status) {
            if alert.is_fatal() {
                self.metrics.fatal_alert();
            }
            self.alerter.alert(alert);
        }

        // A stream that died after its budget is re-established from scratch
        if let ConnectionError::ConnectionLost { operation, .. } = &status.error {
            if self.reconnect_on_loss && operation != "connect" {
                if let Some(connection) = self.connection(name) {
                    if connection.state() == ConnectionState::Disconnected {
                        info!(connection = %name, "Reconnecting lost provider");
                        tokio::spawn(async move { connection.connect().await });
                    }
                }
            }
        }
    }

    fn update_active_gauge(&self) {
        let active = self
            .connections
            .iter()
            .filter(|entry| entry.value().state().is_connected())
            .count();
        self.metrics.set_connections_active(active as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertSeverity;
    use ratefeed_common::{now, ProviderId};
    use ratefeed_connection::ConnectionConfig;
    use ratefeed_fx::{ChannelPublisher, DecimalCalculator, InMemoryRateCache, Published};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    #[derive(Default)]
    struct RecordingAlerter {
        alerts: Mutex<Vec<Alert>>,
    }

    impl Alerter for RecordingAlerter {
        fn alert(&self, alert: Alert) {
            self.alerts.lock().push(alert);
        }
    }

    /// Single-session TCP provider replying `reply` to the handshake and
    /// answering each subscription with one fixed tick.
    async fn provider(reply: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let tick = match line.as_str() {
                    "sub|USDTRY" => "name=USDTRY|bid=34|ask=35|timestamp=2024-12-16T10:15:30Z",
                    "sub|EURUSD" => "name=EURUSD|bid=1.1|ask=1.2|timestamp=2024-12-16T10:15:30Z",
                    _ if line.contains(':') => reply,
                    _ => continue,
                };
                if write.write_all(format!("{tick}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        port
    }

    fn manager() -> (Arc<RateManager>, mpsc::UnboundedReceiver<Published>) {
        let (publisher, rx) = ChannelPublisher::new();
        let manager = RateManager::new(
            Arc::new(InMemoryRateCache::new()),
            Arc::new(DecimalCalculator::new()),
            Arc::new(publisher),
        );
        (Arc::new(manager), rx)
    }

    fn config(connections: Vec<ConnectionConfig>) -> CoordinatorConfig {
        CoordinatorConfig {
            node_id: Some("test-node-1".to_string()),
            rates: vec![CurrencyPair::usd_try(), "EUR_USD".parse().unwrap()],
            connections,
            ..CoordinatorConfig::default()
        }
    }

    fn tcp(port: u16) -> ConnectionConfig {
        ConnectionConfig::tcp("PF1", "127.0.0.1", port)
            .with_credentials("user", "pass")
            .with_retry_limits(2, 2)
            .with_request_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_provider_rates_are_derived() {
        let port = provider("AUTH SUCCESS").await;
        let (manager, mut published) = manager();
        let alerter = Arc::new(RecordingAlerter::default());
        let coordinator = Coordinator::new(
            config(vec![tcp(port)]),
            &ConnectionRegistry::with_defaults(),
            manager,
            alerter.clone(),
        );

        assert_ok!(coordinator.start().await);
        assert!(coordinator.is_running());

        let eur_try: CurrencyPair = "EUR_TRY".parse().unwrap();
        let derived = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match published.recv().await {
                    Some(Published::Calculated(rate)) if rate.pair == eur_try => break rate,
                    Some(_) => continue,
                    None => panic!("publisher closed"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(derived.bid, 37.95);
        assert_eq!(derived.ask, 41.4);

        let subscribers = coordinator.subscribers();
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].name, "PF1");
        assert_eq!(subscribers[0].kind, "tcp");

        assert_ok!(coordinator.stop().await);
        assert_eq!(coordinator.state(), CoordinatorState::Stopped);

        let snapshot = coordinator.metrics().snapshot();
        assert_eq!(snapshot.raw_rates_received, 2);
        assert_eq!(snapshot.rates_accepted, 2);
        assert_eq!(snapshot.connections_active, 0);
        assert!(alerter.alerts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bad_credentials_raise_fatal_alert() {
        let port = provider("AUTH FAILED").await;
        let (manager, _published) = manager();
        let alerter = Arc::new(RecordingAlerter::default());
        let coordinator = Coordinator::new(
            config(vec![tcp(port)]),
            &ConnectionRegistry::with_defaults(),
            manager,
            alerter.clone(),
        );

        assert_ok!(coordinator.start().await);

        let mut raised = false;
        for _ in 0..400 {
            if !alerter.alerts.lock().is_empty() {
                raised = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(raised);

        let alerts = alerter.alerts.lock().clone();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Fatal);
        assert_eq!(alerts[0].subject, "Bad credentials for provider PF1");

        let snapshot = coordinator.metrics().snapshot();
        assert_eq!(snapshot.fatal_alerts, 1);
        assert_eq!(snapshot.connection_errors, 1);

        assert_ok!(coordinator.stop().await);
    }

    #[tokio::test]
    async fn test_commands_require_running_coordinator() {
        let (manager, _published) = manager();
        let coordinator = Coordinator::new(
            config(vec![]),
            &ConnectionRegistry::with_defaults(),
            manager,
            Arc::new(RecordingAlerter::default()),
        );

        assert_eq!(coordinator.node_id(), "test-node-1");
        assert!(matches!(coordinator.connect("PF1"), CommandAck::NotRunning(_)));

        assert_ok!(coordinator.start().await);
        let ack = coordinator.subscribe("PF9", vec![CurrencyPair::usd_try()]);
        assert!(!ack.is_accepted());
        assert_eq!(ack.message(), "No subscriber named PF9");

        assert!(matches!(
            coordinator.start().await,
            Err(CoordinatorError::InvalidState { operation: "start", .. })
        ));

        assert_ok!(coordinator.stop().await);
        assert_ok!(coordinator.stop().await);
        assert!(matches!(coordinator.disconnect("PF1"), CommandAck::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_unbuildable_connections_are_skipped() {
        let (manager, _published) = manager();
        let mut pigeon = ConnectionConfig::rest("PF3", "http://localhost:8080");
        pigeon.kind = "pigeon".to_string();
        let mut disabled = ConnectionConfig::rest("PF4", "http://localhost:8080");
        disabled.enabled = false;

        let coordinator = Coordinator::new(
            config(vec![pigeon, disabled, ConnectionConfig::rest("PF1", "http://localhost:8080")]),
            &ConnectionRegistry::with_defaults(),
            manager,
            Arc::new(RecordingAlerter::default()),
        );

        let subscribers = coordinator.subscribers();
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].name, "PF1");
        assert_eq!(subscribers[0].state, ConnectionState::Disconnected);
        assert!(subscribers[0].endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_channel_handler_forwards_in_order() {
        let (handler, mut rx) = ChannelHandler::new();
        let rate = RawRate::new(
            CurrencyPair::usd_try(),
            ProviderId::new("PF1"),
            34.0,
            35.0,
            now(),
        );

        handler.on_connect("PF1");
        handler.on_rate_update("PF1", rate.clone());
        handler.on_disconnect("PF1");

        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { name }) if name == "PF1"));
        match rx.recv().await {
            Some(ConnectionEvent::RateUpdate { name, rate: received }) => {
                assert_eq!(name, "PF1");
                assert_eq!(received, rate);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Disconnected { .. })));
    }
}
