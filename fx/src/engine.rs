//! Rate reconciliation and cross-rate derivation.

use std::sync::Arc;

use ratefeed_common::{quote_arrays, CalculatedRate, CurrencyPair, MeanRate, RawRate};
use tracing::{debug, error, instrument, warn};

use crate::cache::RateCache;
use crate::calculator::RateCalculator;
use crate::error::{
    CacheError, CalculatorError, EngineError, ErrorHandler, FxResult, LoggingErrorHandler,
};
use crate::publisher::RatePublisher;
use crate::rate_lock::TypeLocks;

/// What happened to one incoming raw rate.
#[derive(Debug, Clone, PartialEq)]
pub enum RateOutcome {
    /// Stored. `bootstrap` is set when it was the first rate of its
    /// `(provider, type)` slot. `derived` lists every rate recalculated.
    Accepted {
        bootstrap: bool,
        derived: Vec<CalculatedRate>,
    },
    /// Deviated from the cross-provider mean by at least one percent.
    Rejected { mean: MeanRate },
    /// Nothing cached for the type when there should have been.
    Aborted,
    /// A calculator or cache failure was handed to the error handler.
    Failed,
}

impl RateOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RateOutcome::Accepted { .. })
    }
}

/// Reconciles raw rates from every provider and derives calculated rates.
///
/// Holds no rate state of its own: every call re-reads the cache, so one
/// instance can be shared by every dispatch thread.
pub struct RateManager {
    cache: Arc<dyn RateCache>,
    calculator: Arc<dyn RateCalculator>,
    publisher: Arc<dyn RatePublisher>,
    error_handler: Arc<dyn ErrorHandler>,
    locks: TypeLocks,
}

impl RateManager {
    /// Create a manager reporting failures through the logging handler.
    pub fn new(
        cache: Arc<dyn RateCache>,
        calculator: Arc<dyn RateCalculator>,
        publisher: Arc<dyn RatePublisher>,
    ) -> Self {
        Self {
            cache,
            calculator,
            publisher,
            error_handler: Arc::new(LoggingErrorHandler),
            locks: TypeLocks::new(),
        }
    }

    /// Set the error handler.
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    /// The cache this manager reads and writes.
    pub fn cache(&self) -> &Arc<dyn RateCache> {
        &self.cache
    }

    /// Reconcile one raw rate and recompute whatever depends on it.
    ///
    /// Never fails: calculator and cache errors go to the error handler and
    /// the call returns [`RateOutcome::Failed`].
    #[instrument(skip(self, rate), fields(rate_type = %rate.pair, provider = %rate.provider))]
    pub fn manage_incoming_raw_rate(&self, rate: RawRate) -> RateOutcome {
        // The log records everything observed, trusted or not
        if let Err(e) = self.publisher.publish_raw(&rate) {
            self.error_handler.handle(&EngineError::Publish(e), &rate);
        }

        let result = self.locks.with_lock(&rate.pair, || self.reconcile(&rate));

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.error_handler.handle(&e, &rate);
                RateOutcome::Failed
            }
        }
    }

    /// Runs under the lock of `rate.pair`.
    fn reconcile(&self, rate: &RawRate) -> FxResult<RateOutcome> {
        let existing = self
            .cache
            .get_raw_rate(&rate.provider, &rate.pair)
            .map_err(|e| self.cache_error(e))?;
        let bootstrap = existing.is_none();

        if bootstrap {
            debug!("First rate for provider and type, storing");
        } else {
            let cached = self
                .cache
                .get_all_raw_rates_for_type(&rate.pair)
                .map_err(|e| self.cache_error(e))?;
            if cached.is_empty() {
                error!("No cached raw rates for type, aborting");
                return Ok(RateOutcome::Aborted);
            }

            let (bids, asks) = quote_arrays(&cached);
            let mean = self
                .calculator
                .calculate_mean_rate(&bids, &asks)
                .map_err(|e| self.calculator_error(e))?;

            let deviates = self
                .calculator
                .has_at_least_one_percent_diff(rate, &mean)
                .map_err(|e| self.calculator_error(e))?;
            if deviates {
                debug!(
                    bid = rate.bid,
                    ask = rate.ask,
                    mean_bid = mean.mean_bid,
                    mean_ask = mean.mean_ask,
                    "Rate deviates from mean, dropping"
                );
                return Ok(RateOutcome::Rejected { mean });
            }
        }

        self.cache
            .save_raw_rate(rate)
            .map_err(|e| self.cache_error(e))?;

        let derived = if rate.pair.is_pivot() {
            self.refresh_from_pivot(rate)?
        } else {
            self.derive_for_type(&rate.pair, rate)?.into_iter().collect()
        };

        Ok(RateOutcome::Accepted { bootstrap, derived })
    }

    /// Recompute the pivot, the pivot pair's own rate, then every other
    /// known type. Runs under the pivot lock.
    fn refresh_from_pivot(&self, rate: &RawRate) -> FxResult<Vec<CalculatedRate>> {
        let cached = self
            .cache
            .get_all_raw_rates_for_type(&rate.pair)
            .map_err(|e| self.cache_error(e))?;
        let (bids, asks) = quote_arrays(&cached);

        let pivot_defined = self
            .cache
            .get_usdmid()
            .map_err(|e| self.cache_error(e))?
            .is_some();

        let usdmid = if pivot_defined {
            self.calculator.calculate_usdmid(&bids, &asks)
        } else {
            self.calculator.calculate_usdmid(&[rate.bid], &[rate.ask])
        }
        .map_err(|e| self.calculator_error(e))?;

        self.cache
            .save_usdmid(usdmid)
            .map_err(|e| self.cache_error(e))?;
        debug!(usdmid, "Pivot updated");

        let own = self
            .calculator
            .calculate_for_usd_try(&bids, &asks)
            .map_err(|e| self.calculator_error(e))?;
        self.store_and_publish(&own, rate)?;

        let mut derived = vec![own];

        let types = self
            .cache
            .raw_rate_types()
            .map_err(|e| self.cache_error(e))?;
        // One failing type must not hold back the others
        for pair in types.iter().filter(|p| !p.is_pivot()) {
            match self.locks.with_lock(pair, || self.derive_for_type(pair, rate)) {
                Ok(recalculated) => derived.extend(recalculated),
                Err(e) => {
                    warn!(rate_type = %pair, error_code = e.error_code(), "Derivation skipped");
                    self.error_handler.handle(&e, rate);
                }
            }
        }

        Ok(derived)
    }

    /// Derive one non-pivot type on behalf of `trigger`. Caller holds the
    /// lock for `pair`.
    fn derive_for_type(
        &self,
        pair: &CurrencyPair,
        trigger: &RawRate,
    ) -> FxResult<Option<CalculatedRate>> {
        let Some(usdmid) = self.cache.get_usdmid().map_err(|e| self.cache_error(e))? else {
            warn!(rate_type = %pair, "Pivot not available yet, skipping derivation");
            return Ok(None);
        };

        let cached = self
            .cache
            .get_all_raw_rates_for_type(pair)
            .map_err(|e| self.cache_error(e))?;
        if cached.is_empty() {
            error!(rate_type = %pair, "No cached raw rates for type, skipping derivation");
            return Ok(None);
        }

        let (bids, asks) = quote_arrays(&cached);
        let calculated = self
            .calculator
            .calculate_for_raw_rate_type(pair, usdmid, &bids, &asks)
            .map_err(|e| self.calculator_error(e))?;
        self.store_and_publish(&calculated, trigger)?;

        Ok(Some(calculated))
    }

    fn store_and_publish(&self, rate: &CalculatedRate, trigger: &RawRate) -> FxResult<()> {
        self.cache
            .save_calculated_rate(rate)
            .map_err(|e| self.cache_error(e))?;

        // A lost publish does not undo the cached value
        if let Err(e) = self.publisher.publish_calculated(rate) {
            self.error_handler.handle(&EngineError::Publish(e), trigger);
        }
        Ok(())
    }

    fn cache_error(&self, source: CacheError) -> EngineError {
        EngineError::Cache {
            cache: self.cache.name().to_string(),
            source,
        }
    }

    fn calculator_error(&self, source: CalculatorError) -> EngineError {
        EngineError::Calculator {
            strategy: self.calculator.strategy().to_string(),
            source,
        }
    }
}
