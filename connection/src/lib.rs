//! RateFeed Provider Connections
//!
//! Connects to upstream rate providers and turns their wire traffic into
//! [`RawRate`](ratefeed_common::RawRate) callbacks.
//!
//! Two transports are built in:
//!
//! - **REST**: health check, then one polling task per subscribed endpoint
//! - **TCP**: credential handshake, then one shared reader demultiplexing ticks
//!
//! Every operation reports through a [`ConnectionHandler`]; nothing returns an
//! error to the caller. Retries are bounded and cancellable.

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod mapper;
pub mod registry;
pub mod rest;
pub mod retry;
pub mod tcp;

pub use config::{ConnectionConfig, KIND_REST, KIND_TCP};
pub use connection::{Connection, ConnectionState, SharedConnection};
pub use error::{ConnectionError, ConnectionStatus};
pub use handler::{ConnectionHandler, LoggingHandler};
pub use registry::{ConnectionFactory, ConnectionRegistry};
pub use rest::RestConnection;
pub use retry::{execute_with_retry, sleep_or_shutdown, RetryPolicy, ShutdownSignal};
pub use tcp::TcpConnection;
