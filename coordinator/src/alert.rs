//! Operator alerting. Delivery (mail, pager) lives behind [`Alerter`].

use std::fmt;

use ratefeed_connection::{ConnectionError, ConnectionStatus};
use tracing::{error, warn};

/// How urgently an operator must react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    /// The provider cannot recover without intervention.
    Fatal,
    Warning,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Fatal => f.write_str("FATAL"),
            AlertSeverity::Warning => f.write_str("WARNING"),
        }
    }
}

/// An operator alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub subject: String,
    pub body: String,
}

impl Alert {
    pub fn fatal(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Fatal,
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn warning(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Warning,
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Alert warranted by a connection error, if any.
    ///
    /// Rejected credentials are fatal, a lost connection is a warning and
    /// individual failed attempts raise nothing.
    pub fn for_status(status: &ConnectionStatus) -> Option<Self> {
        match &status.error {
            ConnectionError::BadCredentials { .. } => Some(Alert::fatal(
                format!("Bad credentials for provider {}", status.provider),
                status.to_string(),
            )),
            ConnectionError::ConnectionLost { .. } => Some(Alert::warning(
                format!("Connection lost to provider {}", status.provider),
                status.to_string(),
            )),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == AlertSeverity::Fatal
    }
}

/// Alert sink.
pub trait Alerter: Send + Sync {
    fn alert(&self, alert: Alert);
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone)]
pub struct LoggingAlerter;

impl Alerter for LoggingAlerter {
    fn alert(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Fatal => {
                error!(severity = %alert.severity, subject = %alert.subject, body = %alert.body, "Alert")
            }
            AlertSeverity::Warning => {
                warn!(severity = %alert.severity, subject = %alert.subject, body = %alert.body, "Alert")
            }
        }
    }
}
