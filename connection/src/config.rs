//! Provider connection configuration.

use std::fmt;
use std::time::Duration;

use ratefeed_common::constants::{
    DEFAULT_HEALTH_RETRY_LIMIT, DEFAULT_REQUEST_INTERVAL_MS, DEFAULT_REQUEST_RETRY_LIMIT,
    DEFAULT_REQUEST_TIMEOUT_MS,
};
use ratefeed_common::{CurrencyPair, ProviderId};
use serde::{Deserialize, Serialize};

/// Transport kind for REST providers.
pub const KIND_REST: &str = "rest";

/// Transport kind for streaming TCP providers.
pub const KIND_TCP: &str = "tcp";

/// Configuration for one upstream provider connection.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Unique connection name, also used as the provider id of its rates.
    pub name: String,
    /// Transport kind, resolved through the registry.
    pub kind: String,
    /// Disabled connections are not instantiated.
    pub enabled: bool,
    /// Base URL of a REST provider.
    pub url: String,
    /// Host of a TCP provider.
    pub host: String,
    /// Port of a TCP provider.
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Interval between retries and between polls.
    pub request_interval_ms: u64,
    /// Consecutive failures a streaming loop tolerates.
    pub request_retry_limit: u32,
    /// Attempts allowed for the handshake and each initial request.
    pub health_retry_limit: u32,
    /// Timeout for each outbound operation.
    pub request_timeout_ms: u64,
    /// Rates always subscribed on this connection.
    pub include_rates: Vec<CurrencyPair>,
    /// Rates never subscribed on this connection.
    pub exclude_rates: Vec<CurrencyPair>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: KIND_REST.to_string(),
            enabled: true,
            url: "http://localhost:8080".to_string(),
            host: "localhost".to_string(),
            port: 8081,
            username: String::new(),
            password: String::new(),
            request_interval_ms: DEFAULT_REQUEST_INTERVAL_MS,
            request_retry_limit: DEFAULT_REQUEST_RETRY_LIMIT,
            health_retry_limit: DEFAULT_HEALTH_RETRY_LIMIT,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            include_rates: Vec::new(),
            exclude_rates: Vec::new(),
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("url", &self.url)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("request_interval_ms", &self.request_interval_ms)
            .field("request_retry_limit", &self.request_retry_limit)
            .field("health_retry_limit", &self.health_retry_limit)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("include_rates", &self.include_rates)
            .field("exclude_rates", &self.exclude_rates)
            .finish()
    }
}

impl ConnectionConfig {
    /// Configuration for a REST provider rooted at `url`.
    pub fn rest(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: KIND_REST.to_string(),
            url: url.into(),
            ..Self::default()
        }
    }

    /// Configuration for a TCP provider at `host:port`.
    pub fn tcp(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            kind: KIND_TCP.to_string(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Set credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set both retry budgets.
    pub fn with_retry_limits(mut self, health: u32, request: u32) -> Self {
        self.health_retry_limit = health;
        self.request_retry_limit = request;
        self
    }

    /// Set the retry/poll interval.
    pub fn with_request_interval(mut self, interval: Duration) -> Self {
        self.request_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the per-operation timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_include_rates(mut self, rates: Vec<CurrencyPair>) -> Self {
        self.include_rates = rates;
        self
    }

    pub fn with_exclude_rates(mut self, rates: Vec<CurrencyPair>) -> Self {
        self.exclude_rates = rates;
        self
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Provider id stamped on every rate this connection produces.
    pub fn provider_id(&self) -> ProviderId {
        ProviderId::new(self.name.clone())
    }

    /// Human-readable transport target, used in diagnostics.
    pub fn target(&self) -> String {
        match self.kind.as_str() {
            KIND_TCP => format!("{}:{}", self.host, self.port),
            _ => self.url.clone(),
        }
    }

    /// Rates to subscribe: caller list plus includes, minus excludes.
    ///
    /// Order of first appearance is kept and duplicates are dropped.
    pub fn effective_rates(&self, requested: &[CurrencyPair]) -> Vec<CurrencyPair> {
        let mut rates: Vec<CurrencyPair> = Vec::new();
        for pair in requested.iter().chain(self.include_rates.iter()) {
            if !self.exclude_rates.contains(pair) && !rates.contains(pair) {
                rates.push(pair.clone());
            }
        }
        rates
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Connection name cannot be empty".to_string());
        }

        if !self.provider_id().is_valid() {
            return Err(format!("Connection name {:?} is not a valid provider id", self.name));
        }

        match self.kind.as_str() {
            KIND_REST => {
                if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
                    return Err(format!("Connection {}: url must be http(s)", self.name));
                }
            }
            KIND_TCP => {
                if self.host.is_empty() {
                    return Err(format!("Connection {}: host cannot be empty", self.name));
                }
                if self.port == 0 {
                    return Err(format!("Connection {}: port cannot be zero", self.name));
                }
            }
            // Other kinds may be registered at runtime
            _ => {}
        }

        if self.health_retry_limit == 0 || self.request_retry_limit == 0 {
            return Err(format!("Connection {}: retry limits must be positive", self.name));
        }

        if self.request_timeout_ms == 0 {
            return Err(format!("Connection {}: request timeout cannot be zero", self.name));
        }

        Ok(())
    }
}
