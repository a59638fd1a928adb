//! RateFeed Coordinator
//!
//! The coordinator owns the provider connections, forwards every raw rate
//! to the FX engine through per-type ordered workers and serves operator
//! commands to connect, disconnect and (un)subscribe providers.

pub mod alert;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod state;

pub use alert::{Alert, AlertSeverity, Alerter, LoggingAlerter};
pub use config::{load_rates, CoordinatorConfig};
pub use coordinator::{ChannelHandler, CommandAck, ConnectionEvent, Coordinator, SubscriberStatus};
pub use dispatcher::RateDispatcher;
pub use error::{ConfigError, CoordinatorError};
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use state::CoordinatorState;
