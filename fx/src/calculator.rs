//! Calculation strategies.
//!
//! The engine never does rate arithmetic itself. Everything numeric goes
//! through a [`RateCalculator`], so the cross-rate formula or the deviation
//! rule can be swapped without touching the reconciliation logic.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ratefeed_common::{now, CalculatedRate, CurrencyPair, MeanRate, RawRate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CalculatorError, CalculatorResult};
use crate::process::{ProcessCalculator, DEFAULT_PROCESS_TIMEOUT};

/// Five pure operations over parallel bid/ask arrays.
///
/// Index `i` of `bids` and `asks` is one observation. Implementations must
/// not keep mutable state between calls.
pub trait RateCalculator: Send + Sync {
    /// Strategy name used in error reports.
    fn strategy(&self) -> &str;

    fn calculate_mean_rate(&self, bids: &[f64], asks: &[f64]) -> CalculatorResult<MeanRate>;

    /// Derive the TRY cross-rate of `pair` through the pivot.
    fn calculate_for_raw_rate_type(
        &self,
        pair: &CurrencyPair,
        usdmid: f64,
        bids: &[f64],
        asks: &[f64],
    ) -> CalculatorResult<CalculatedRate>;

    /// Derive the pivot pair's own rate. No pivot multiplication.
    fn calculate_for_usd_try(&self, bids: &[f64], asks: &[f64])
        -> CalculatorResult<CalculatedRate>;

    /// Whether `incoming` deviates from `mean` by at least one percent.
    fn has_at_least_one_percent_diff(
        &self,
        incoming: &RawRate,
        mean: &MeanRate,
    ) -> CalculatorResult<bool>;

    fn calculate_usdmid(&self, bids: &[f64], asks: &[f64]) -> CalculatorResult<f64>;
}

/// How bid and ask deviations combine into one accept/reject decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationRule {
    /// Average of both percentages must reach one percent.
    #[default]
    Average,
    /// Either side reaching one percent is enough.
    Either,
    /// Both sides must reach one percent.
    Both,
}

/// Native strategy doing exact decimal arithmetic.
///
/// Quotes are converted through their shortest decimal representation, so
/// `1.022` is treated as exactly `1.022` and results convert back without
/// binary noise.
#[derive(Debug, Clone, Default)]
pub struct DecimalCalculator {
    rule: DeviationRule,
}

impl DecimalCalculator {
    /// Create a calculator using the average deviation rule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deviation rule.
    pub fn with_rule(mut self, rule: DeviationRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn rule(&self) -> DeviationRule {
        self.rule
    }

    fn means(&self, bids: &[f64], asks: &[f64]) -> CalculatorResult<(Decimal, Decimal)> {
        if bids.is_empty() || bids.len() != asks.len() {
            return Err(CalculatorError::InvalidInput(format!(
                "expected equal non-empty arrays, got {} bids and {} asks",
                bids.len(),
                asks.len()
            )));
        }
        Ok((mean(bids)?, mean(asks)?))
    }
}

impl RateCalculator for DecimalCalculator {
    fn strategy(&self) -> &str {
        "decimal"
    }

    fn calculate_mean_rate(&self, bids: &[f64], asks: &[f64]) -> CalculatorResult<MeanRate> {
        let (bid, ask) = self.means(bids, asks)?;
        Ok(MeanRate::new(to_f64(bid)?, to_f64(ask)?))
    }

    fn calculate_for_raw_rate_type(
        &self,
        pair: &CurrencyPair,
        usdmid: f64,
        bids: &[f64],
        asks: &[f64],
    ) -> CalculatorResult<CalculatedRate> {
        let (bid, ask) = self.means(bids, asks)?;
        let pivot = to_decimal(usdmid)?;
        let cross_bid = bid.checked_mul(pivot).ok_or_else(|| overflow("cross bid"))?;
        let cross_ask = ask.checked_mul(pivot).ok_or_else(|| overflow("cross ask"))?;
        Ok(CalculatedRate::new(
            pair.calculated_type(),
            to_f64(cross_bid)?,
            to_f64(cross_ask)?,
            now(),
        ))
    }

    fn calculate_for_usd_try(
        &self,
        bids: &[f64],
        asks: &[f64],
    ) -> CalculatorResult<CalculatedRate> {
        let (bid, ask) = self.means(bids, asks)?;
        Ok(CalculatedRate::new(
            CurrencyPair::usd_try(),
            to_f64(bid)?,
            to_f64(ask)?,
            now(),
        ))
    }

    fn has_at_least_one_percent_diff(
        &self,
        incoming: &RawRate,
        mean: &MeanRate,
    ) -> CalculatorResult<bool> {
        let pct_bid = percent_diff(incoming.bid, mean.mean_bid)?;
        let pct_ask = percent_diff(incoming.ask, mean.mean_ask)?;

        Ok(match self.rule {
            DeviationRule::Average => {
                let total = pct_bid
                    .checked_add(pct_ask)
                    .ok_or_else(|| overflow("deviation sum"))?;
                total / Decimal::TWO >= Decimal::ONE
            }
            DeviationRule::Either => pct_bid >= Decimal::ONE || pct_ask >= Decimal::ONE,
            DeviationRule::Both => pct_bid >= Decimal::ONE && pct_ask >= Decimal::ONE,
        })
    }

    fn calculate_usdmid(&self, bids: &[f64], asks: &[f64]) -> CalculatorResult<f64> {
        let (bid, ask) = self.means(bids, asks)?;
        let total = bid.checked_add(ask).ok_or_else(|| overflow("usdmid sum"))?;
        to_f64(total / Decimal::TWO)
    }
}

/// `|incoming - mean| / incoming * 100`
fn percent_diff(incoming: f64, mean: f64) -> CalculatorResult<Decimal> {
    let incoming = to_decimal(incoming)?;
    if incoming.is_zero() {
        return Err(CalculatorError::InvalidInput(
            "incoming quote is zero".to_string(),
        ));
    }
    let mean = to_decimal(mean)?;
    incoming
        .checked_sub(mean)
        .and_then(|delta| delta.checked_div(incoming))
        .and_then(|ratio| ratio.abs().checked_mul(Decimal::ONE_HUNDRED))
        .ok_or_else(|| overflow("deviation"))
}

fn mean(values: &[f64]) -> CalculatorResult<Decimal> {
    let mut sum = Decimal::ZERO;
    for value in values {
        sum = sum
            .checked_add(to_decimal(*value)?)
            .ok_or_else(|| overflow("quote sum"))?;
    }
    sum.checked_div(Decimal::from(values.len()))
        .ok_or_else(|| overflow("quote mean"))
}

fn overflow(what: &str) -> CalculatorError {
    CalculatorError::InvalidInput(format!("{what} overflows"))
}

pub(crate) fn to_decimal(value: f64) -> CalculatorResult<Decimal> {
    if !value.is_finite() {
        return Err(CalculatorError::InvalidInput(format!(
            "non-finite quote {value}"
        )));
    }
    Decimal::from_str(&value.to_string())
        .or_else(|_| Decimal::from_scientific(&format!("{value:e}")))
        .map_err(|e| CalculatorError::InvalidInput(format!("quote {value}: {e}")))
}

pub(crate) fn to_f64(value: Decimal) -> CalculatorResult<f64> {
    value
        .normalize()
        .to_string()
        .parse::<f64>()
        .map_err(|e| CalculatorError::InvalidInput(format!("result {value}: {e}")))
}

/// Which strategy to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CalculatorConfig {
    /// In-process decimal arithmetic.
    Decimal {
        #[serde(default)]
        rule: DeviationRule,
    },
    /// External program, started fresh for every call.
    Process {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Deadline for one invocation
        #[serde(default = "default_process_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_process_timeout_ms() -> u64 {
    DEFAULT_PROCESS_TIMEOUT.as_millis() as u64
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        CalculatorConfig::Decimal {
            rule: DeviationRule::default(),
        }
    }
}

impl CalculatorConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            CalculatorConfig::Decimal { .. } => Ok(()),
            CalculatorConfig::Process { program, .. } if program.trim().is_empty() => {
                Err("Calculator program cannot be empty".to_string())
            }
            CalculatorConfig::Process { timeout_ms: 0, .. } => {
                Err("Calculator timeout must be positive".to_string())
            }
            CalculatorConfig::Process { .. } => Ok(()),
        }
    }
}

/// Build the configured strategy.
pub fn build_calculator(config: &CalculatorConfig) -> Arc<dyn RateCalculator> {
    match config {
        CalculatorConfig::Decimal { rule } => Arc::new(DecimalCalculator::new().with_rule(*rule)),
        CalculatorConfig::Process {
            program,
            args,
            timeout_ms,
        } => Arc::new(
            ProcessCalculator::new(program.clone(), args.clone())
                .with_timeout(Duration::from_millis(*timeout_ms)),
        ),
    }
}
