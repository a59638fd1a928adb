//! Rate records flowing through the engine.

use serde::{Deserialize, Serialize};

use crate::currency::CurrencyPair;
use crate::identifiers::ProviderId;
use crate::time::Timestamp;

/// A single bid/ask tick received from a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRate {
    /// The currency pair quoted.
    #[serde(rename = "type")]
    pub pair: CurrencyPair,
    /// Where the tick came from.
    pub provider: ProviderId,
    pub bid: f64,
    pub ask: f64,
    /// Provider timestamp, truncated to whole seconds by the mappers.
    pub timestamp: Timestamp,
}

impl RawRate {
    /// Create a new raw rate.
    pub fn new(
        pair: CurrencyPair,
        provider: ProviderId,
        bid: f64,
        ask: f64,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            pair,
            provider,
            bid,
            ask,
            timestamp,
        }
    }
}

/// A derived cross-provider rate. One slot per type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedRate {
    #[serde(rename = "type")]
    pub pair: CurrencyPair,
    pub bid: f64,
    pub ask: f64,
    /// When the derivation ran.
    pub timestamp: Timestamp,
}

impl CalculatedRate {
    /// Create a new calculated rate.
    pub fn new(pair: CurrencyPair, bid: f64, ask: f64, timestamp: Timestamp) -> Self {
        Self {
            pair,
            bid,
            ask,
            timestamp,
        }
    }
}

/// Mean of all cached observations for one type. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanRate {
    pub mean_bid: f64,
    pub mean_ask: f64,
}

impl MeanRate {
    pub fn new(mean_bid: f64, mean_ask: f64) -> Self {
        Self { mean_bid, mean_ask }
    }
}

/// Split raw rates into the parallel bid/ask arrays calculators work on.
pub fn quote_arrays(rates: &[RawRate]) -> (Vec<f64>, Vec<f64>) {
    rates.iter().map(|r| (r.bid, r.ask)).unzip()
}
