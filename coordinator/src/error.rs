//! Coordinator error types.

use std::path::PathBuf;

use ratefeed_common::RateParseError;
use thiserror::Error;

use crate::state::CoordinatorState;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid rates list: {0}")]
    Rates(#[from] RateParseError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Coordinator lifecycle errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Coordinator cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CoordinatorState,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CoordinatorError {
    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoordinatorError::InvalidState { .. } => "INVALID_STATE",
            CoordinatorError::Config(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;
