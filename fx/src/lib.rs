//! RateFeed FX Engine
//!
//! Reconciles raw bid/ask rates from many providers and derives TRY
//! cross-rates through the `USD_TRY` pivot.
//!
//! # Features
//!
//! - Outlier rejection against the cross-provider mean
//! - Pivot (USDMID) bootstrap and cascading recompute of every cross-rate
//! - Pluggable calculation strategies, in-process or out-of-process
//! - Per currency-pair serialization so unrelated pairs never contend
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ratefeed_fx::{DecimalCalculator, InMemoryRateCache, RateManager, TracingPublisher};
//!
//! let manager = RateManager::new(
//!     Arc::new(InMemoryRateCache::new()),
//!     Arc::new(DecimalCalculator::new()),
//!     Arc::new(TracingPublisher),
//! );
//!
//! let outcome = manager.manage_incoming_raw_rate(rate);
//! ```

pub mod cache;
pub mod calculator;
pub mod engine;
pub mod error;
pub mod process;
pub mod publisher;
pub mod rate_lock;

pub use cache::{CacheStats, InMemoryRateCache, RateCache, SharedRateCache};
pub use calculator::{
    build_calculator, CalculatorConfig, DecimalCalculator, DeviationRule, RateCalculator,
};
pub use engine::{RateManager, RateOutcome};
pub use error::{
    CacheError, CalculatorError, EngineError, ErrorHandler, LoggingErrorHandler, PublishError,
};
pub use process::ProcessCalculator;
pub use publisher::{ChannelPublisher, Published, RatePublisher, TracingPublisher};
pub use rate_lock::TypeLocks;
