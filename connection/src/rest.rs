//! Polling REST provider connection.
//!
//! `GET {url}/api/health` is the handshake and `GET {url}/api/currencies/{ENDPOINT}`
//! returns the latest quote. Each subscribed endpoint gets its own polling task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ratefeed_common::CurrencyPair;
use reqwest::{Client, StatusCode};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConnectionConfig, KIND_REST};
use crate::connection::{Connection, ConnectionState, Session};
use crate::error::ConnectionError;
use crate::handler::ConnectionHandler;
use crate::mapper;
use crate::retry::{execute_with_retry, sleep_or_shutdown, ShutdownSignal};

/// One polling task and its run flag.
struct Poller {
    active: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Poller {
    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.handle.abort();
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

struct RestInner {
    session: Session,
    client: Client,
    pollers: DashMap<String, Poller>,
}

/// Connection to a provider that serves quotes over HTTP.
pub struct RestConnection {
    inner: Arc<RestInner>,
}

impl RestConnection {
    /// Create a new REST connection. Nothing is sent until [`Connection::connect`].
    pub fn new(
        config: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self, ConnectionError> {
        config.validate().map_err(ConnectionError::Configuration)?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ConnectionError::Configuration(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(RestInner {
                session: Session::new(config, handler),
                client,
                pollers: DashMap::new(),
            }),
        })
    }
}

impl RestInner {
    fn base_url(&self) -> &str {
        self.session.config().url.trim_end_matches('/')
    }

    fn health_url(&self) -> String {
        format!("{}/api/health", self.base_url())
    }

    fn rate_url(&self, endpoint: &str) -> String {
        format!("{}/api/currencies/{}", self.base_url(), endpoint)
    }

    /// One authenticated GET; non-2xx is an error.
    async fn get(&self, url: &str) -> Result<String, ConnectionError> {
        let config = self.session.config();
        let response = self
            .client
            .get(url)
            .basic_auth(&config.username, Some(&config.password))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ConnectionError::BadCredentials {
                provider: self.session.name().to_string(),
            });
        }
        if !status.is_success() {
            return Err(ConnectionError::UnexpectedStatus {
                status: status.as_u16(),
            });
        }

        Ok(response.text().await?)
    }

    fn deliver(&self, body: &str) {
        let name = self.session.name();
        match mapper::parse_rest_rate(self.session.provider(), body) {
            Ok(rate) => self.session.handler().on_rate_update(name, rate),
            Err(err) => self.session.handler().on_rate_error(name, err),
        }
    }

    fn is_polling(&self, endpoint: &str) -> bool {
        self.pollers
            .get(endpoint)
            .map(|poller| poller.is_active())
            .unwrap_or(false)
    }

    fn start_poller(self: &Arc<Self>, endpoint: String, url: String, signal: ShutdownSignal) {
        let active = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(Arc::clone(self).poll(
            endpoint.clone(),
            url,
            active.clone(),
            signal,
        ));

        if let Some(previous) = self.pollers.insert(endpoint, Poller { active, handle }) {
            previous.stop();
        }
    }

    /// Re-request `url` every interval until stopped or the failure budget is spent.
    async fn poll(
        self: Arc<Self>,
        endpoint: String,
        url: String,
        active: Arc<AtomicBool>,
        signal: ShutdownSignal,
    ) {
        let session = &self.session;
        let limit = session.config().request_retry_limit.max(1);
        let interval = session.config().request_interval();
        let mut failures = 0u32;

        debug!(connection = %session.name(), endpoint = %endpoint, "Polling started");

        while active.load(Ordering::SeqCst) && !signal.is_triggered() {
            if sleep_or_shutdown(interval, &signal).await.is_err() || !active.load(Ordering::SeqCst) {
                break;
            }

            let result = tokio::select! {
                result = self.get(&url) => result,
                _ = signal.triggered() => break,
            };

            match result {
                Ok(body) => {
                    failures = 0;
                    self.deliver(&body);
                }
                Err(err) if !err.is_retryable() => {
                    session.report("poll", &url, err, None);
                    break;
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        connection = %session.name(),
                        endpoint = %endpoint,
                        failures,
                        limit,
                        error = %err,
                        "Poll failed"
                    );
                    if failures >= limit {
                        session.report(
                            "poll",
                            &url,
                            ConnectionError::ConnectionLost {
                                operation: format!("poll {endpoint}"),
                                attempts: failures,
                            },
                            Some(err.to_string()),
                        );
                        break;
                    }
                }
            }
        }

        active.store(false, Ordering::SeqCst);
        debug!(connection = %session.name(), endpoint = %endpoint, "Polling stopped");
    }
}

#[async_trait]
impl Connection for RestConnection {
    fn name(&self) -> &str {
        self.inner.session.name()
    }

    fn kind(&self) -> &'static str {
        KIND_REST
    }

    fn state(&self) -> ConnectionState {
        self.inner.session.state()
    }

    fn active_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self
            .inner
            .pollers
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| entry.key().clone())
            .collect();
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

        let url = inner.health_url();
        let attempts = session.config().health_retry_limit;
        info!(url = %url, attempts, "Checking provider health");

        let result = execute_with_retry(
            "connect",
            session.policy(attempts),
            &signal,
            || inner.get(&url),
            |attempt, err| session.report_attempt("connect", &url, attempt, attempts, err),
        )
        .await;

        match result {
            Ok(_) => {
                if session.transition(ConnectionState::Connecting, ConnectionState::Connected) {
                    info!("Provider healthy");
                    session.handler().on_connect(session.name());
                }
            }
            Err(err) => session.connect_failed(&url, err),
        }
    }

    #[instrument(skip(self, rates), fields(connection = %self.name()))]
    async fn subscribe(&self, rates: &[CurrencyPair]) {
        let inner = &self.inner;
        let session = &inner.session;

        let rates = session.config().effective_rates(rates);
        if rates.is_empty() {
            warn!("No rates to subscribe");
            return;
        }

        if !session.begin_subscribe() {
            session.report("subscribe", inner.base_url(), ConnectionError::NotConnected, None);
            return;
        }

        let signal = session.signal();
        let attempts = session.config().health_retry_limit;

        for pair in rates {
            if signal.is_triggered() {
                break;
            }

            let endpoint = pair.to_endpoint();
            if inner.is_polling(&endpoint) {
                debug!(endpoint = %endpoint, "Already streaming");
                continue;
            }

            let url = inner.rate_url(&endpoint);
            let result = execute_with_retry(
                "subscribe",
                session.policy(attempts),
                &signal,
                || inner.get(&url),
                |attempt, err| session.report_attempt("subscribe", &url, attempt, attempts, err),
            )
            .await;

            match result {
                Ok(body) => {
                    info!(endpoint = %endpoint, "Subscribed");
                    session.handler().on_subscribe(session.name(), &endpoint);
                    session.handler().on_rate_available(session.name(), &pair);
                    inner.deliver(&body);
                    inner.start_poller(endpoint, url, signal.clone());
                }
                Err(ConnectionError::Cancelled) => break,
                Err(lost @ ConnectionError::ConnectionLost { .. }) => {
                    session.report("subscribe", &url, lost, None);
                }
                // Already reported by the failing attempt
                Err(_) => {}
            }
        }

        session.settle_subscriptions(!self.active_endpoints().is_empty());
    }

    #[instrument(skip(self, rates), fields(connection = %self.name()))]
    async fn unsubscribe(&self, rates: &[CurrencyPair]) {
        let session = &self.inner.session;

        for pair in rates {
            let endpoint = pair.to_endpoint();
            match self.inner.pollers.remove(&endpoint) {
                Some((_, poller)) => {
                    poller.stop();
                    info!(endpoint = %endpoint, "Unsubscribed");
                    session.handler().on_unsubscribe(session.name(), &endpoint);
                }
                None => debug!(endpoint = %endpoint, "Endpoint was not subscribed"),
            }
        }

        if self.active_endpoints().is_empty() {
            session.transition(ConnectionState::Streaming, ConnectionState::Connected);
        }
    }

    #[instrument(skip(self), fields(connection = %self.name()))]
    async fn disconnect(&self) {
        let session = &self.inner.session;
        let was_open = session.close();

        let endpoints: Vec<String> = self
            .inner
            .pollers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for endpoint in endpoints {
            if let Some((_, poller)) = self.inner.pollers.remove(&endpoint) {
                poller.stop();
            }
        }

        if was_open {
            info!("Disconnected");
            session.handler().on_disconnect(session.name());
        }
    }
}
