//! Callbacks through which a connection reports everything it does.

use ratefeed_common::{CurrencyPair, RateParseError, RawRate};

use crate::error::ConnectionStatus;

/// Receiver of connection lifecycle and rate events.
///
/// Callbacks run on the connection's own tasks and must not block.
pub trait ConnectionHandler: Send + Sync {
    fn on_connect(&self, name: &str);

    fn on_disconnect(&self, name: &str);

    fn on_subscribe(&self, name: &str, endpoint: &str);

    fn on_unsubscribe(&self, name: &str, endpoint: &str);

    /// First successful response for a subscribed rate type.
    fn on_rate_available(&self, name: &str, pair: &CurrencyPair);

    fn on_rate_update(&self, name: &str, rate: RawRate);

    /// A payload could not be mapped; the connection stays up.
    fn on_rate_error(&self, name: &str, error: RateParseError);

    fn on_connection_error(&self, name: &str, status: ConnectionStatus);
}

/// Handler that logs events but doesn't process them.
#[derive(Debug, Default, Clone)]
pub struct LoggingHandler;

impl ConnectionHandler for LoggingHandler {
    fn on_connect(&self, name: &str) {
        tracing::info!(connection = %name, "Connected");
    }

    fn on_disconnect(&self, name: &str) {
        tracing::info!(connection = %name, "Disconnected");
    }

    fn on_subscribe(&self, name: &str, endpoint: &str) {
        tracing::info!(connection = %name, endpoint = %endpoint, "Subscribed");
    }

    fn on_unsubscribe(&self, name: &str, endpoint: &str) {
        tracing::info!(connection = %name, endpoint = %endpoint, "Unsubscribed");
    }

    fn on_rate_available(&self, name: &str, pair: &CurrencyPair) {
        tracing::info!(connection = %name, pair = %pair, "Rate available");
    }

    fn on_rate_update(&self, name: &str, rate: RawRate) {
        tracing::debug!(
            connection = %name,
            pair = %rate.pair,
            bid = rate.bid,
            ask = rate.ask,
            "Rate update"
        );
    }

    fn on_rate_error(&self, name: &str, error: RateParseError) {
        tracing::warn!(connection = %name, error = %error, "Unparseable rate payload");
    }

    fn on_connection_error(&self, name: &str, status: ConnectionStatus) {
        if status.is_fatal() {
            tracing::error!(connection = %name, code = status.error.error_code(), "{}", status);
        } else {
            tracing::warn!(connection = %name, code = status.error.error_code(), "{}", status);
        }
    }
}

#[cfg(test)]
pub(crate) mod recording {
    //! Handler that records every callback, for connection tests.

    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub(crate) enum Recorded {
        Connect,
        Disconnect,
        Subscribe(String),
        Unsubscribe(String),
        RateAvailable(CurrencyPair),
        RateUpdate(RawRate),
        RateError(RateParseError),
        ConnectionError(ConnectionStatus),
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingHandler {
        events: Mutex<Vec<Recorded>>,
    }

    impl RecordingHandler {
        pub(crate) fn events(&self) -> Vec<Recorded> {
            self.events.lock().clone()
        }

        pub(crate) fn count(&self, predicate: impl Fn(&Recorded) -> bool) -> usize {
            self.events.lock().iter().filter(|e| predicate(e)).count()
        }

        pub(crate) fn errors(&self) -> Vec<ConnectionStatus> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    Recorded::ConnectionError(status) => Some(status.clone()),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn updates(&self) -> Vec<RawRate> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    Recorded::RateUpdate(rate) => Some(rate.clone()),
                    _ => None,
                })
                .collect()
        }

        /// Poll until `predicate` holds or two seconds pass.
        pub(crate) async fn wait_for(&self, predicate: impl Fn(&[Recorded]) -> bool) -> bool {
            for _ in 0..400 {
                if predicate(&self.events.lock()) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            false
        }

        fn push(&self, event: Recorded) {
            self.events.lock().push(event);
        }
    }

    impl ConnectionHandler for RecordingHandler {
        fn on_connect(&self, _name: &str) {
            self.push(Recorded::Connect);
        }

        fn on_disconnect(&self, _name: &str) {
            self.push(Recorded::Disconnect);
        }

        fn on_subscribe(&self, _name: &str, endpoint: &str) {
            self.push(Recorded::Subscribe(endpoint.to_string()));
        }

        fn on_unsubscribe(&self, _name: &str, endpoint: &str) {
            self.push(Recorded::Unsubscribe(endpoint.to_string()));
        }

        fn on_rate_available(&self, _name: &str, pair: &CurrencyPair) {
            self.push(Recorded::RateAvailable(pair.clone()));
        }

        fn on_rate_update(&self, _name: &str, rate: RawRate) {
            self.push(Recorded::RateUpdate(rate));
        }

        fn on_rate_error(&self, _name: &str, error: RateParseError) {
            self.push(Recorded::RateError(error));
        }

        fn on_connection_error(&self, _name: &str, status: ConnectionStatus) {
            self.push(Recorded::ConnectionError(status));
        }
    }
}
