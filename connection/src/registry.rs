//! Maps a transport kind to the factory that builds its connections.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{ConnectionConfig, KIND_REST, KIND_TCP};
use crate::connection::SharedConnection;
use crate::error::ConnectionError;
use crate::handler::ConnectionHandler;
use crate::rest::RestConnection;
use crate::tcp::TcpConnection;

/// Builds a connection from its configuration and handler.
pub type ConnectionFactory =
    fn(ConnectionConfig, Arc<dyn ConnectionHandler>) -> Result<SharedConnection, ConnectionError>;

/// Registry of connection factories by kind.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    factories: HashMap<String, ConnectionFactory>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `rest` and `tcp` transports.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(KIND_REST, rest_factory);
        registry.register(KIND_TCP, tcp_factory);
        registry
    }

    /// Register or replace the factory for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, factory: ConnectionFactory) {
        let kind = kind.into();
        debug!(kind = %kind, "Registering connection kind");
        self.factories.insert(kind, factory);
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Build the connection described by `config`.
    pub fn create(
        &self,
        config: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<SharedConnection, ConnectionError> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            ConnectionError::Configuration(format!(
                "unknown connection kind {:?} for {}",
                config.kind, config.name
            ))
        })?;
        factory(config, handler)
    }
}

fn rest_factory(
    config: ConnectionConfig,
    handler: Arc<dyn ConnectionHandler>,
) -> Result<SharedConnection, ConnectionError> {
    Ok(Arc::new(RestConnection::new(config, handler)?))
}

fn tcp_factory(
    config: ConnectionConfig,
    handler: Arc<dyn ConnectionHandler>,
) -> Result<SharedConnection, ConnectionError> {
    Ok(Arc::new(TcpConnection::new(config, handler)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::handler::LoggingHandler;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_kinds() {
        let registry = ConnectionRegistry::with_defaults();
        assert_eq!(registry.kinds(), vec!["rest".to_string(), "tcp".to_string()]);
        assert!(registry.contains("tcp"));
        assert!(!ConnectionRegistry::new().contains("rest"));
    }

    #[tokio::test]
    async fn test_create_by_kind() {
        let registry = ConnectionRegistry::with_defaults();
        let handler: Arc<dyn ConnectionHandler> = Arc::new(LoggingHandler);

        let rest = assert_ok!(
            registry.create(ConnectionConfig::rest("PF1", "http://localhost:8080"), handler.clone())
        );
        assert_eq!(rest.kind(), "rest");
        assert_eq!(rest.name(), "PF1");
        assert_eq!(rest.state(), ConnectionState::Disconnected);

        let tcp = assert_ok!(registry.create(ConnectionConfig::tcp("PF2", "localhost", 8081), handler));
        assert_eq!(tcp.kind(), "tcp");
    }

    #[test]
    fn test_unknown_kind_and_invalid_config() {
        let registry = ConnectionRegistry::with_defaults();
        let handler: Arc<dyn ConnectionHandler> = Arc::new(LoggingHandler);

        let mut config = ConnectionConfig::rest("PF3", "http://localhost:8080");
        config.kind = "websocket".to_string();
        let err = assert_err!(registry.create(config, handler.clone()).map(|_| ()));
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");

        let invalid = ConnectionConfig::tcp("PF2", "localhost", 0);
        assert!(matches!(
            registry.create(invalid, handler),
            Err(ConnectionError::Configuration(_))
        ));
    }
}
