//! Time utilities and timing defaults for provider connections.

use chrono::{DateTime, SubsecRound, Utc};

/// Connection timing defaults, in milliseconds unless stated otherwise.
pub mod constants {
    /// Interval between retry attempts and between polls (1 second).
    pub const DEFAULT_REQUEST_INTERVAL_MS: u64 = 1_000;

    /// Timeout applied to each outbound network operation (5 seconds).
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

    /// Attempts allowed for the health/auth handshake and initial requests.
    pub const DEFAULT_HEALTH_RETRY_LIMIT: u32 = 5;

    /// Consecutive failures a streaming loop tolerates before giving up.
    pub const DEFAULT_REQUEST_RETRY_LIMIT: u32 = 5;
}

/// A timestamp, always UTC.
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Drop sub-second precision from a provider timestamp.
pub fn truncate_to_seconds(timestamp: Timestamp) -> Timestamp {
    timestamp.trunc_subsecs(0)
}

/// Parse an ISO 8601 / RFC 3339 timestamp into UTC.
pub fn parse_timestamp(text: &str) -> Result<Timestamp, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(text.trim())?.with_timezone(&Utc))
}
