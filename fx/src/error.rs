//! Engine error types and the centralized error handler.

use ratefeed_common::RawRate;
use thiserror::Error;
use tracing::{error, warn};

/// Errors raised by a rate cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store could not be reached or refused the operation.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by a calculation strategy.
#[derive(Debug, Error)]
pub enum CalculatorError {
    /// Arrays of unequal length, empty arrays, zero or non-finite quotes.
    #[error("Invalid calculator input: {0}")]
    InvalidInput(String),

    /// The strategy ran and reported a failure.
    #[error("Strategy {strategy} failed: {reason}")]
    StrategyFailed { strategy: String, reason: String },

    /// The strategy answered with something other than the expected shape.
    #[error("Strategy {strategy} returned an unexpected result: {reason}")]
    InvalidResponse { strategy: String, reason: String },

    /// The strategy could not be started.
    #[error("Strategy {strategy} is unavailable: {reason}")]
    Unavailable { strategy: String, reason: String },

    /// The strategy did not answer before its deadline.
    #[error("Strategy {strategy} timed out after {timeout_ms}ms")]
    TimedOut { strategy: String, timeout_ms: u64 },
}

/// Errors raised while handing records to the durable log.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The downstream channel is gone.
    #[error("Publish channel closed, dropped record {key}")]
    ChannelClosed { key: String },

    /// The record could not be encoded.
    #[error("Could not encode record {key}: {reason}")]
    Encoding { key: String, reason: String },
}

/// A failure inside one `manage_incoming_raw_rate` call, with enough
/// context to find the failing strategy or cache instance.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Calculator {strategy} failed: {source}")]
    Calculator {
        strategy: String,
        #[source]
        source: CalculatorError,
    },

    #[error("Cache {cache} failed: {source}")]
    Cache {
        cache: String,
        #[source]
        source: CacheError,
    },

    #[error("Publishing failed: {0}")]
    Publish(#[from] PublishError),
}

impl EngineError {
    /// Get error code for logs and metrics labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Calculator { .. } => "CALCULATOR_ERROR",
            EngineError::Cache { .. } => "CACHE_ERROR",
            EngineError::Publish(_) => "PUBLISH_ERROR",
        }
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Result type for calculator operations.
pub type CalculatorResult<T> = Result<T, CalculatorError>;

/// Result type for engine internals.
pub type FxResult<T> = Result<T, EngineError>;

/// Receives every engine failure. Failures never escape the engine.
pub trait ErrorHandler: Send + Sync {
    /// Handle a failure raised while processing `rate`.
    fn handle(&self, error: &EngineError, rate: &RawRate);
}

/// Default handler that only logs.
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle(&self, err: &EngineError, rate: &RawRate) {
        match err {
            EngineError::Calculator { strategy, source } => {
                error!(
                    strategy = %strategy,
                    rate_type = %rate.pair,
                    provider = %rate.provider,
                    error = %source,
                    "Calculator failed"
                );
            }
            EngineError::Cache { cache, source } => {
                error!(
                    cache = %cache,
                    rate_type = %rate.pair,
                    provider = %rate.provider,
                    error = %source,
                    "Cache operation failed"
                );
            }
            EngineError::Publish(source) => {
                warn!(
                    rate_type = %rate.pair,
                    provider = %rate.provider,
                    error = %source,
                    "Publishing failed"
                );
            }
        }
    }
}
