//! Wire payload mapping for both provider protocols.
//!
//! REST bodies are JSON objects `{"name", "bid", "ask", "timestamp"}`; TCP
//! ticks are single lines `name=EURUSD|bid=1.0|ask=1.1|timestamp=<ISO 8601>`.
//! The rate's provider is always the connection name, never a payload field.

use ratefeed_common::{
    parse_timestamp, truncate_to_seconds, CurrencyPair, ProviderId, RateParseError, RawRate,
};
use serde::Deserialize;

/// Handshake reply accepting the credentials.
pub const AUTH_SUCCESS: &str = "AUTH SUCCESS";

/// Handshake reply rejecting the credentials.
pub const AUTH_FAILED: &str = "AUTH FAILED";

/// First line sent on a TCP session.
pub fn auth_line(username: &str, password: &str) -> String {
    format!("{username}:{password}")
}

pub fn subscribe_command(endpoint: &str) -> String {
    format!("sub|{endpoint}")
}

pub fn unsubscribe_command(endpoint: &str) -> String {
    format!("unsub|{endpoint}")
}

#[derive(Debug, Deserialize)]
struct RestQuote {
    name: String,
    bid: f64,
    ask: f64,
    timestamp: String,
}

/// Map a REST response body.
pub fn parse_rest_rate(provider: &ProviderId, body: &str) -> Result<RawRate, RateParseError> {
    let quote: RestQuote =
        serde_json::from_str(body).map_err(|e| RateParseError::payload(body, e))?;
    build_rate(provider, body, &quote.name, quote.bid, quote.ask, &quote.timestamp)
}

/// Map one TCP tick line.
pub fn parse_tcp_rate(provider: &ProviderId, line: &str) -> Result<RawRate, RateParseError> {
    let mut name = None;
    let mut bid = None;
    let mut ask = None;
    let mut timestamp = None;

    for field in line.trim().split('|') {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| RateParseError::payload(line, format!("malformed field {field:?}")))?;
        let slot = match key.trim() {
            "name" => &mut name,
            "bid" => &mut bid,
            "ask" => &mut ask,
            "timestamp" => &mut timestamp,
            other => {
                return Err(RateParseError::payload(line, format!("unknown field {other:?}")))
            }
        };
        *slot = Some(value.trim());
    }

    let bid = parse_quote(line, "bid", required(line, bid, "bid")?)?;
    let ask = parse_quote(line, "ask", required(line, ask, "ask")?)?;

    build_rate(
        provider,
        line,
        required(line, name, "name")?,
        bid,
        ask,
        required(line, timestamp, "timestamp")?,
    )
}

fn required<'a>(payload: &str, value: Option<&'a str>, field: &str) -> Result<&'a str, RateParseError> {
    value.ok_or_else(|| RateParseError::payload(payload, format!("missing field {field:?}")))
}

fn parse_quote(payload: &str, field: &str, value: &str) -> Result<f64, RateParseError> {
    value
        .parse::<f64>()
        .map_err(|e| RateParseError::payload(payload, format!("{field}: {e}")))
}

fn build_rate(
    provider: &ProviderId,
    payload: &str,
    name: &str,
    bid: f64,
    ask: f64,
    timestamp: &str,
) -> Result<RawRate, RateParseError> {
    let pair = CurrencyPair::from_endpoint(name.trim())
        .map_err(|e| RateParseError::payload(payload, e))?;

    if !(bid.is_finite() && ask.is_finite()) {
        return Err(RateParseError::payload(payload, "bid and ask must be finite"));
    }

    let timestamp = parse_timestamp(timestamp)
        .map_err(|e| RateParseError::payload(payload, format!("timestamp: {e}")))?;

    Ok(RawRate::new(
        pair,
        provider.clone(),
        bid,
        ask,
        truncate_to_seconds(timestamp),
    ))
}
