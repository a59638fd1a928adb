//! Parse errors shared by every crate that handles rate text.

use thiserror::Error;

/// Errors raised while turning provider or operator text into rate types.
///
/// These never tear down a connection: a malformed tick is reported and
/// discarded, the stream keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateParseError {
    /// Not a three letter upper-case currency code.
    #[error("Invalid currency code: {0:?}")]
    InvalidCurrency(String),

    /// Not a canonical `XXX_YYY` pair.
    #[error("Invalid currency pair: {0:?}")]
    InvalidPair(String),

    /// Not a six letter endpoint token.
    #[error("Invalid endpoint token: {0:?}")]
    InvalidEndpoint(String),

    /// Comma separated rates list did not match the expected shape.
    #[error("Invalid rates list: {0:?}")]
    InvalidRateList(String),

    /// An inbound provider payload could not be mapped to a raw rate.
    #[error("Could not parse rate payload {payload:?}: {reason}")]
    InvalidPayload { payload: String, reason: String },
}

impl RateParseError {
    /// Build a payload error from any displayable cause.
    pub fn payload(payload: impl Into<String>, reason: impl ToString) -> Self {
        RateParseError::InvalidPayload {
            payload: payload.into(),
            reason: reason.to_string(),
        }
    }

    /// Get error code for logs and metrics labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            RateParseError::InvalidCurrency(_) => "INVALID_CURRENCY",
            RateParseError::InvalidPair(_) => "INVALID_PAIR",
            RateParseError::InvalidEndpoint(_) => "INVALID_ENDPOINT",
            RateParseError::InvalidRateList(_) => "INVALID_RATE_LIST",
            RateParseError::InvalidPayload { .. } => "INVALID_PAYLOAD",
        }
    }
}
