//! Connection error taxonomy and diagnostic context.

use std::fmt;
use std::io;

use thiserror::Error;

/// Failures of a provider connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connection reset: {0}")]
    Reset(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Unexpected HTTP status {status}")]
    UnexpectedStatus { status: u16 },

    #[error("Bad credentials for provider {provider}")]
    BadCredentials { provider: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Connection lost: {operation} failed after {attempts} attempts")]
    ConnectionLost { operation: String, attempts: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Invalid connection configuration: {0}")]
    Configuration(String),
}

impl ConnectionError {
    /// Transport failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::Refused(_)
                | ConnectionError::Reset(_)
                | ConnectionError::Timeout(_)
                | ConnectionError::UnexpectedStatus { .. }
                | ConnectionError::Io(_)
        )
    }

    /// Failures that need an operator, not a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::BadCredentials { .. } | ConnectionError::Configuration(_)
        )
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectionError::Refused(_) => "CONNECTION_REFUSED",
            ConnectionError::Reset(_) => "CONNECTION_RESET",
            ConnectionError::Timeout(_) => "TIMEOUT",
            ConnectionError::UnexpectedStatus { .. } => "UNEXPECTED_STATUS",
            ConnectionError::BadCredentials { .. } => "BAD_CREDENTIALS",
            ConnectionError::NotConnected => "NOT_CONNECTED",
            ConnectionError::ConnectionLost { .. } => "CONNECTION_LOST",
            ConnectionError::Cancelled => "CANCELLED",
            ConnectionError::Io(_) => "IO_ERROR",
            ConnectionError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ConnectionError::UnexpectedStatus { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectionError::Refused(err.to_string()),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ConnectionError::Reset(err.to_string()),
            io::ErrorKind::TimedOut => ConnectionError::Timeout(err.to_string()),
            _ => ConnectionError::Io(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for ConnectionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ConnectionError::Timeout(err.to_string())
        } else if err.is_connect() {
            ConnectionError::Refused(err.to_string())
        } else if let Some(status) = err.status() {
            ConnectionError::UnexpectedStatus {
                status: status.as_u16(),
            }
        } else {
            ConnectionError::Io(err.to_string())
        }
    }
}

/// Context attached to every reported connection error.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    /// Connection name.
    pub provider: String,
    /// Operation that failed, e.g. `connect` or `poll`.
    pub operation: String,
    /// URL or `host:port`.
    pub target: String,
    pub http_status: Option<u16>,
    pub notes: Option<String>,
    pub error: ConnectionError,
}

impl ConnectionStatus {
    pub fn new(
        provider: impl Into<String>,
        operation: impl Into<String>,
        target: impl Into<String>,
        error: ConnectionError,
    ) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
            target: target.into(),
            http_status: error.http_status(),
            notes: None,
            error,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.error.is_fatal()
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on {}: {}",
            self.provider, self.operation, self.target, self.error
        )?;
        if let Some(status) = self.http_status {
            write!(f, " (HTTP {status})")?;
        }
        if let Some(notes) = &self.notes {
            write!(f, " [{notes}]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ConnectionError::Refused("x".into()).is_retryable());
        assert!(ConnectionError::UnexpectedStatus { status: 503 }.is_retryable());
        assert!(!ConnectionError::Cancelled.is_retryable());
        assert!(!ConnectionError::Cancelled.is_fatal());

        let creds = ConnectionError::BadCredentials {
            provider: "PF2".into(),
        };
        assert!(creds.is_fatal());
        assert!(!creds.is_retryable());
        assert_eq!(creds.error_code(), "BAD_CREDENTIALS");
    }

    #[test]
    fn test_io_error_mapping() {
        let refused: ConnectionError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(matches!(refused, ConnectionError::Refused(_)));

        let eof: ConnectionError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(eof, ConnectionError::Reset(_)));

        let other: ConnectionError = io::Error::from(io::ErrorKind::InvalidData).into();
        assert!(matches!(other, ConnectionError::Io(_)));
    }

    #[test]
    fn test_status_display() {
        let status = ConnectionStatus::new(
            "PF1",
            "connect",
            "http://localhost:8080/api/health",
            ConnectionError::UnexpectedStatus { status: 500 },
        )
        .with_notes("attempt 2/5");

        assert_eq!(status.http_status, Some(500));
        assert_eq!(
            status.to_string(),
            "PF1 connect on http://localhost:8080/api/health: Unexpected HTTP status 500 (HTTP 500) [attempt 2/5]"
        );
    }
}
