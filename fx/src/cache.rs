//! Rate cache contract and the in-memory implementation.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use ratefeed_common::{CalculatedRate, CurrencyPair, ProviderId, RawRate};
use tracing::debug;

use crate::error::CacheResult;

/// Key layout shared by every cache backend.
pub mod keys {
    use ratefeed_common::{CurrencyPair, ProviderId};

    /// Prefix of raw rate keys.
    pub const RAW_RATES_PREFIX: &str = "raw_rates::rates:";

    /// Prefix of calculated rate keys.
    pub const CALC_RATES_PREFIX: &str = "calc_rates::rates:";

    /// Key of the pivot scalar.
    pub const USDMID_KEY: &str = "usdmid";

    /// `raw_rates::rates:<provider>:<TYPE>`
    pub fn raw_rate_key(provider: &ProviderId, pair: &CurrencyPair) -> String {
        format!("{RAW_RATES_PREFIX}{provider}:{pair}")
    }

    /// `calc_rates::rates:<TYPE>`
    pub fn calc_rate_key(pair: &CurrencyPair) -> String {
        format!("{CALC_RATES_PREFIX}{pair}")
    }

    /// Whether a raw rate key belongs to `pair`.
    pub fn is_raw_rate_key_for(key: &str, pair: &CurrencyPair) -> bool {
        key.starts_with(RAW_RATES_PREFIX) && key.ends_with(&format!(":{pair}"))
    }
}

/// Keyed store for raw rates, calculated rates and the pivot scalar.
///
/// The store exclusively owns rate state; every operation is a single
/// logical read or overwrite.
pub trait RateCache: Send + Sync {
    /// Instance name used in error reports.
    fn name(&self) -> &str;

    fn get_raw_rate(&self, provider: &ProviderId, pair: &CurrencyPair)
        -> CacheResult<Option<RawRate>>;

    /// Overwrite the `(provider, type)` slot.
    fn save_raw_rate(&self, rate: &RawRate) -> CacheResult<()>;

    /// Every provider's cached rate for `pair`.
    fn get_all_raw_rates_for_type(&self, pair: &CurrencyPair) -> CacheResult<Vec<RawRate>>;

    /// Every type with at least one cached raw rate.
    fn raw_rate_types(&self) -> CacheResult<Vec<CurrencyPair>>;

    fn get_calculated_rate(&self, pair: &CurrencyPair) -> CacheResult<Option<CalculatedRate>>;

    /// Overwrite the slot of `rate.pair`.
    fn save_calculated_rate(&self, rate: &CalculatedRate) -> CacheResult<()>;

    fn get_usdmid(&self) -> CacheResult<Option<f64>>;

    fn save_usdmid(&self, usdmid: f64) -> CacheResult<()>;
}

/// Thread-safe in-memory cache.
pub struct InMemoryRateCache {
    name: String,
    raw_rates: DashMap<String, RawRate>,
    calculated_rates: DashMap<String, CalculatedRate>,
    usdmid: RwLock<Option<f64>>,
}

impl InMemoryRateCache {
    /// Create a new, empty cache.
    pub fn new() -> Self {
        Self::with_name("in-memory")
    }

    /// Create a new cache reporting under `name`.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw_rates: DashMap::new(),
            calculated_rates: DashMap::new(),
            usdmid: RwLock::new(None),
        }
    }

    /// Drop every entry, pivot included.
    pub fn clear(&self) {
        self.raw_rates.clear();
        self.calculated_rates.clear();
        *self.usdmid.write() = None;
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            raw_entries: self.raw_rates.len(),
            calculated_entries: self.calculated_rates.len(),
            has_usdmid: self.usdmid.read().is_some(),
        }
    }
}

impl Default for InMemoryRateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RateCache for InMemoryRateCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_raw_rate(
        &self,
        provider: &ProviderId,
        pair: &CurrencyPair,
    ) -> CacheResult<Option<RawRate>> {
        let key = keys::raw_rate_key(provider, pair);
        Ok(self.raw_rates.get(&key).map(|entry| entry.value().clone()))
    }

    fn save_raw_rate(&self, rate: &RawRate) -> CacheResult<()> {
        let key = keys::raw_rate_key(&rate.provider, &rate.pair);
        debug!(key = %key, bid = rate.bid, ask = rate.ask, "Saving raw rate");
        self.raw_rates.insert(key, rate.clone());
        Ok(())
    }

    fn get_all_raw_rates_for_type(&self, pair: &CurrencyPair) -> CacheResult<Vec<RawRate>> {
        let mut rates: Vec<RawRate> = self
            .raw_rates
            .iter()
            .filter(|entry| keys::is_raw_rate_key_for(entry.key(), pair))
            .map(|entry| entry.value().clone())
            .collect();
        // Stable order keeps calculator input reproducible
        rates.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(rates)
    }

    fn raw_rate_types(&self) -> CacheResult<Vec<CurrencyPair>> {
        let mut types: Vec<CurrencyPair> = self
            .raw_rates
            .iter()
            .map(|entry| entry.value().pair.clone())
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    fn get_calculated_rate(&self, pair: &CurrencyPair) -> CacheResult<Option<CalculatedRate>> {
        let key = keys::calc_rate_key(pair);
        Ok(self
            .calculated_rates
            .get(&key)
            .map(|entry| entry.value().clone()))
    }

    fn save_calculated_rate(&self, rate: &CalculatedRate) -> CacheResult<()> {
        let key = keys::calc_rate_key(&rate.pair);
        debug!(key = %key, bid = rate.bid, ask = rate.ask, "Saving calculated rate");
        self.calculated_rates.insert(key, rate.clone());
        Ok(())
    }

    fn get_usdmid(&self) -> CacheResult<Option<f64>> {
        Ok(*self.usdmid.read())
    }

    fn save_usdmid(&self, usdmid: f64) -> CacheResult<()> {
        debug!(key = keys::USDMID_KEY, usdmid, "Saving pivot");
        *self.usdmid.write() = Some(usdmid);
        Ok(())
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub raw_entries: usize,
    pub calculated_entries: usize,
    pub has_usdmid: bool,
}

/// Shared rate cache.
pub type SharedRateCache = Arc<dyn RateCache>;
