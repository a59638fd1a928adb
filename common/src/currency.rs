//! Currency codes, currency pairs and their wire-level endpoint tokens.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RateParseError;

/// Canonical text of the pivot pair.
pub const PIVOT_PAIR: &str = "USD_TRY";

const SEPARATOR: char = '_';

/// Three letter upper-case currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Parse a currency code. Only `[A-Z]{3}` is accepted.
    pub fn parse(code: &str) -> Result<Self, RateParseError> {
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code.to_string()))
        } else {
            Err(RateParseError::InvalidCurrency(code.to_string()))
        }
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn turkish_lira() -> Self {
        Self("TRY".to_string())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Currency {
    type Error = RateParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

/// A currency pair in canonical `XXX_YYY` form.
///
/// Providers address pairs by an endpoint token with the separator removed
/// (`EUR_USD` is requested as `EURUSD`); the mapping is a bijection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyPair {
    /// Base currency.
    pub base: Currency,
    /// Quote currency.
    pub quote: Currency,
}

impl CurrencyPair {
    /// Create a new currency pair.
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self { base, quote }
    }

    /// The `USD_TRY` pivot pair.
    pub fn usd_try() -> Self {
        Self::new(Currency::usd(), Currency::turkish_lira())
    }

    /// Whether this pair is the pivot every cross-rate is derived through.
    pub fn is_pivot(&self) -> bool {
        self.base.code() == "USD" && self.quote.code() == "TRY"
    }

    /// Endpoint token for this pair (`EUR_USD` -> `EURUSD`).
    pub fn to_endpoint(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Parse an endpoint token (`EURUSD` -> `EUR_USD`).
    pub fn from_endpoint(token: &str) -> Result<Self, RateParseError> {
        if token.len() != 6 || !token.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(RateParseError::InvalidEndpoint(token.to_string()));
        }

        let (base, quote) = token.split_at(3);
        Ok(Self::new(Currency::parse(base)?, Currency::parse(quote)?))
    }

    /// Type under which the derived rate for this pair is stored and published.
    ///
    /// The pivot keeps its own name, every other pair is converted against
    /// the lira (`EUR_USD` -> `EUR_TRY`).
    pub fn calculated_type(&self) -> Self {
        if self.is_pivot() {
            self.clone()
        } else {
            Self::new(self.base.clone(), Currency::turkish_lira())
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.base, SEPARATOR, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = RateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| RateParseError::InvalidPair(s.to_string()))?;

        match (Currency::parse(base), Currency::parse(quote)) {
            (Ok(base), Ok(quote)) => Ok(Self::new(base, quote)),
            _ => Err(RateParseError::InvalidPair(s.to_string())),
        }
    }
}

impl TryFrom<String> for CurrencyPair {
    type Error = RateParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CurrencyPair> for String {
    fn from(pair: CurrencyPair) -> Self {
        pair.to_string()
    }
}

/// Parse a comma separated rates list such as `EUR_USD,GBP_USD,USD_TRY`.
///
/// Surrounding whitespace is ignored, anything else must be canonical pairs
/// separated by single commas. Duplicates are dropped, first one wins.
pub fn parse_rate_list(input: &str) -> Result<Vec<CurrencyPair>, RateParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(RateParseError::InvalidRateList(input.to_string()));
    }

    let mut pairs: Vec<CurrencyPair> = Vec::new();
    for item in trimmed.split(',') {
        let pair: CurrencyPair = item
            .parse()
            .map_err(|_| RateParseError::InvalidRateList(input.to_string()))?;
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pair(s: &str) -> CurrencyPair {
        s.parse().unwrap()
    }

    #[test]
    fn test_pair_parse_and_display() {
        let p = pair("EUR_USD");
        assert_eq!(p.base.code(), "EUR");
        assert_eq!(p.quote.code(), "USD");
        assert_eq!(p.to_string(), "EUR_USD");
    }

    #[test]
    fn test_pair_rejects_malformed_codes() {
        for bad in ["EURUSD", "EUR-USD", "eur_usd", "EU_USD", "EUR_USDX", "EUR_", ""] {
            assert!(bad.parse::<CurrencyPair>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_endpoint_mapping() {
        assert_eq!(pair("GBP_USD").to_endpoint(), "GBPUSD");
        assert_eq!(CurrencyPair::from_endpoint("GBPUSD").unwrap(), pair("GBP_USD"));
        assert!(CurrencyPair::from_endpoint("GBPUS").is_err());
        assert!(CurrencyPair::from_endpoint("GBP_USD").is_err());
    }

    #[test]
    fn test_pivot_and_calculated_type() {
        assert!(CurrencyPair::usd_try().is_pivot());
        assert_eq!(CurrencyPair::usd_try().to_string(), PIVOT_PAIR);
        assert!(!pair("EUR_USD").is_pivot());

        assert_eq!(pair("USD_TRY").calculated_type(), pair("USD_TRY"));
        assert_eq!(pair("EUR_USD").calculated_type(), pair("EUR_TRY"));
        assert_eq!(pair("GBP_USD").calculated_type(), pair("GBP_TRY"));
    }

    #[test]
    fn test_pair_serde_uses_canonical_text() {
        let json = serde_json::to_string(&pair("EUR_USD")).unwrap();
        assert_eq!(json, "\"EUR_USD\"");

        let back: CurrencyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pair("EUR_USD"));
        assert!(serde_json::from_str::<CurrencyPair>("\"EURUSD\"").is_err());
    }

    #[test]
    fn test_parse_rate_list() {
        let rates = parse_rate_list(" EUR_USD,GBP_USD,USD_TRY,EUR_USD\n").unwrap();
        assert_eq!(rates, vec![pair("EUR_USD"), pair("GBP_USD"), pair("USD_TRY")]);

        assert!(parse_rate_list("").is_err());
        assert!(parse_rate_list("EUR_USD,").is_err());
        assert!(parse_rate_list("EUR_USD, GBP_USD").is_err());
        assert!(parse_rate_list("EUR_USD;GBP_USD").is_err());
    }

    proptest! {
        #[test]
        fn prop_endpoint_round_trip(base in "[A-Z]{3}", quote in "[A-Z]{3}") {
            let original = pair(&format!("{base}_{quote}"));
            let endpoint = original.to_endpoint();
            prop_assert_eq!(endpoint.len(), 6);
            prop_assert_eq!(CurrencyPair::from_endpoint(&endpoint).unwrap(), original);
        }
    }
}
