//! Connection contract, lifecycle states and the state shared by every transport.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use ratefeed_common::{CurrencyPair, ProviderId};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, ConnectionStatus};
use crate::handler::ConnectionHandler;
use crate::retry::{RetryPolicy, ShutdownSignal};

/// Connection lifecycle state.
///
/// Errors are reported through the handler and are never a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    /// Handshake or health check in progress.
    Connecting,
    Connected,
    /// Initial subscription requests in flight.
    Subscribing,
    /// At least one endpoint delivering rates.
    Streaming,
}

impl ConnectionState {
    /// Check if the transport is usable.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Subscribing | ConnectionState::Streaming
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Streaming => "streaming",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upstream provider connection.
///
/// No operation returns an error; every outcome is delivered to the
/// connection's [`ConnectionHandler`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// Configured connection name.
    fn name(&self) -> &str;

    /// Transport kind, e.g. `rest` or `tcp`.
    fn kind(&self) -> &'static str;

    fn state(&self) -> ConnectionState;

    /// Endpoints currently streaming.
    fn active_endpoints(&self) -> Vec<String>;

    /// Perform the health check or handshake within the retry budget.
    async fn connect(&self);

    async fn subscribe(&self, rates: &[CurrencyPair]);

    async fn unsubscribe(&self, rates: &[CurrencyPair]);

    /// Stop every stream and release the transport. Idempotent.
    async fn disconnect(&self);
}

/// Shared connection handle.
pub type SharedConnection = Arc<dyn Connection>;

/// Configuration, handler, state and cancellation signal of one connection.
pub(crate) struct Session {
    config: ConnectionConfig,
    provider: ProviderId,
    handler: Arc<dyn ConnectionHandler>,
    state: RwLock<ConnectionState>,
    shutdown: Mutex<ShutdownSignal>,
}

impl Session {
    pub(crate) fn new(config: ConnectionConfig, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            provider: config.provider_id(),
            config,
            handler,
            state: RwLock::new(ConnectionState::Disconnected),
            shutdown: Mutex::new(ShutdownSignal::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub(crate) fn handler(&self) -> &dyn ConnectionHandler {
        self.handler.as_ref()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        let previous = *state;
        if previous != next {
            debug!(connection = %self.name(), from = %previous, to = %next, "State change");
            *state = next;
        }
    }

    /// Move from `from` to `to` only if the state is still `from`.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.write();
        if *state != from {
            return false;
        }
        debug!(connection = %self.name(), from = %from, to = %to, "State change");
        *state = to;
        true
    }

    /// Enter `Subscribing` if the transport is usable.
    pub(crate) fn begin_subscribe(&self) -> bool {
        let mut state = self.state.write();
        if !state.is_connected() {
            return false;
        }
        *state = ConnectionState::Subscribing;
        true
    }

    /// Settle on `Streaming` or `Connected` unless the connection went away meanwhile.
    pub(crate) fn settle_subscriptions(&self, streaming: bool) {
        let mut state = self.state.write();
        if state.is_connected() {
            *state = if streaming {
                ConnectionState::Streaming
            } else {
                ConnectionState::Connected
            };
        }
    }

    /// Finish a connect attempt that did not succeed.
    pub(crate) fn connect_failed(&self, target: &str, error: ConnectionError) {
        match error {
            ConnectionError::Cancelled => debug!(connection = %self.name(), "Connect cancelled"),
            lost @ ConnectionError::ConnectionLost { .. } => {
                warn!(connection = %self.name(), error = %lost, "Provider unreachable, giving up");
                self.report("connect", target, lost, None);
            }
            // Already reported by the failing attempt
            _ => {}
        }
        self.transition(ConnectionState::Connecting, ConnectionState::Disconnected);
    }

    /// Move to `Connecting` with a fresh signal, unless already connecting or connected.
    pub(crate) fn begin_connect(&self) -> Option<ShutdownSignal> {
        let mut state = self.state.write();
        if *state != ConnectionState::Disconnected {
            return None;
        }
        *state = ConnectionState::Connecting;

        let signal = ShutdownSignal::new();
        *self.shutdown.lock() = signal.clone();
        Some(signal)
    }

    /// Current cancellation signal.
    pub(crate) fn signal(&self) -> ShutdownSignal {
        self.shutdown.lock().clone()
    }

    /// Trigger cancellation and mark the connection disconnected.
    ///
    /// Returns true if this call performed the transition.
    pub(crate) fn close(&self) -> bool {
        self.shutdown.lock().trigger();
        let mut state = self.state.write();
        let was_open = *state != ConnectionState::Disconnected;
        *state = ConnectionState::Disconnected;
        was_open
    }

    /// Retry policy with `attempts` and the configured interval.
    pub(crate) fn policy(&self, attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, self.config.request_interval())
    }

    /// Deliver a connection error with context to the handler.
    pub(crate) fn report(
        &self,
        operation: &str,
        target: &str,
        error: ConnectionError,
        notes: Option<String>,
    ) {
        let mut status = ConnectionStatus::new(self.name(), operation, target, error);
        if let Some(notes) = notes {
            status = status.with_notes(notes);
        }
        self.handler.on_connection_error(self.name(), status);
    }

    /// Report one failed attempt of a retry loop.
    pub(crate) fn report_attempt(
        &self,
        operation: &str,
        target: &str,
        attempt: u32,
        attempts: u32,
        error: &ConnectionError,
    ) {
        self.report(
            operation,
            target,
            error.clone(),
            Some(format!("attempt {attempt}/{attempts}")),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::recording::{Recorded, RecordingHandler};

    #[test]
    fn test_connected_states() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Subscribing.is_connected());
        assert!(ConnectionState::Streaming.is_connected());
        assert_eq!(ConnectionState::Streaming.to_string(), "streaming");
    }

    #[test]
    fn test_session_lifecycle() {
        let handler = Arc::new(RecordingHandler::default());
        let session = Session::new(ConnectionConfig::rest("PF1", "http://localhost:1"), handler.clone());

        let signal = session.begin_connect().unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(session.begin_connect().is_none());

        assert!(session.close());
        assert!(signal.is_triggered());
        assert!(!session.close());

        // A new connect gets a fresh, untriggered signal
        let fresh = session.begin_connect().unwrap();
        assert!(!fresh.is_triggered());
    }

    #[test]
    fn test_report_carries_context() {
        let handler = Arc::new(RecordingHandler::default());
        let session = Session::new(ConnectionConfig::rest("PF1", "http://localhost:1"), handler.clone());

        session.report_attempt(
            "connect",
            "http://localhost:1/api/health",
            2,
            5,
            &ConnectionError::UnexpectedStatus { status: 503 },
        );

        match handler.events().as_slice() {
            [Recorded::ConnectionError(status)] => {
                assert_eq!(status.provider, "PF1");
                assert_eq!(status.operation, "connect");
                assert_eq!(status.http_status, Some(503));
                assert_eq!(status.notes.as_deref(), Some("attempt 2/5"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }
}
