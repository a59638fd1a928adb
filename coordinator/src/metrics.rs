//! Metrics collection for coordinator monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ratefeed_fx::RateOutcome;

/// Coordinator metrics.
pub struct Metrics {
    /// Raw rates received from every provider.
    pub raw_rates_received: AtomicU64,
    /// Raw rates accepted into the cache.
    pub rates_accepted: AtomicU64,
    /// Raw rates dropped as outliers.
    pub rates_rejected: AtomicU64,
    /// Raw rates whose processing failed or was aborted.
    pub rates_failed: AtomicU64,
    /// Calculated rates published.
    pub calculated_published: AtomicU64,
    /// Payloads that could not be mapped.
    pub rate_parse_errors: AtomicU64,
    /// Connection errors reported by providers.
    pub connection_errors: AtomicU64,
    /// Fatal alerts raised.
    pub fatal_alerts: AtomicU64,
    /// Connections currently usable.
    pub connections_active: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            raw_rates_received: AtomicU64::new(0),
            rates_accepted: AtomicU64::new(0),
            rates_rejected: AtomicU64::new(0),
            rates_failed: AtomicU64::new(0),
            calculated_published: AtomicU64::new(0),
            rate_parse_errors: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            fatal_alerts: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
        }
    }

    pub fn rate_received(&self) {
        self.raw_rates_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record what the rate manager did with one raw rate.
    pub fn record_outcome(&self, outcome: &RateOutcome) {
        match outcome {
            RateOutcome::Accepted { derived, .. } => {
                self.rates_accepted.fetch_add(1, Ordering::Relaxed);
                self.calculated_published
                    .fetch_add(derived.len() as u64, Ordering::Relaxed);
            }
            RateOutcome::Rejected { .. } => {
                self.rates_rejected.fetch_add(1, Ordering::Relaxed);
            }
            RateOutcome::Aborted | RateOutcome::Failed => self.rate_failed(),
        }
    }

    pub fn rate_failed(&self) {
        self.rates_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_error(&self) {
        self.rate_parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fatal_alert(&self) {
        self.fatal_alerts.fetch_add(1, Ordering::Relaxed);
    }

    /// Set active connections count.
    pub fn set_connections_active(&self, count: u64) {
        self.connections_active.store(count, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            raw_rates_received: self.raw_rates_received.load(Ordering::Relaxed),
            rates_accepted: self.rates_accepted.load(Ordering::Relaxed),
            rates_rejected: self.rates_rejected.load(Ordering::Relaxed),
            rates_failed: self.rates_failed.load(Ordering::Relaxed),
            calculated_published: self.calculated_published.load(Ordering::Relaxed),
            rate_parse_errors: self.rate_parse_errors.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            fatal_alerts: self.fatal_alerts.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP ratefeed_raw_rates_received Total raw rates received
# TYPE ratefeed_raw_rates_received counter
ratefeed_raw_rates_received {}

# HELP ratefeed_rates_accepted Total raw rates accepted
# TYPE ratefeed_rates_accepted counter
ratefeed_rates_accepted {}

# HELP ratefeed_rates_rejected Total raw rates rejected as outliers
# TYPE ratefeed_rates_rejected counter
ratefeed_rates_rejected {}

# HELP ratefeed_rates_failed Total raw rates whose processing failed
# TYPE ratefeed_rates_failed counter
ratefeed_rates_failed {}

# HELP ratefeed_calculated_published Total calculated rates published
# TYPE ratefeed_calculated_published counter
ratefeed_calculated_published {}

# HELP ratefeed_rate_parse_errors Total unparseable provider payloads
# TYPE ratefeed_rate_parse_errors counter
ratefeed_rate_parse_errors {}

# HELP ratefeed_connection_errors Total provider connection errors
# TYPE ratefeed_connection_errors counter
ratefeed_connection_errors {}

# HELP ratefeed_fatal_alerts Total fatal alerts raised
# TYPE ratefeed_fatal_alerts counter
ratefeed_fatal_alerts {}

# HELP ratefeed_connections_active Current usable provider connections
# TYPE ratefeed_connections_active gauge
ratefeed_connections_active {}
"#,
            snapshot.raw_rates_received,
            snapshot.rates_accepted,
            snapshot.rates_rejected,
            snapshot.rates_failed,
            snapshot.calculated_published,
            snapshot.rate_parse_errors,
            snapshot.connection_errors,
            snapshot.fatal_alerts,
            snapshot.connections_active,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub raw_rates_received: u64,
    pub rates_accepted: u64,
    pub rates_rejected: u64,
    pub rates_failed: u64,
    pub calculated_published: u64,
    pub rate_parse_errors: u64,
    pub connection_errors: u64,
    pub fatal_alerts: u64,
    pub connections_active: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
