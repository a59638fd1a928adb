//! Coordinator configuration.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use ratefeed_common::{parse_rate_list, CurrencyPair};
use ratefeed_connection::ConnectionConfig;
use ratefeed_fx::CalculatorConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Node ID, generated at startup when absent.
    pub node_id: Option<String>,
    /// Rate types subscribed on every connection.
    pub rates: Vec<CurrencyPair>,
    /// Upstream providers.
    pub connections: Vec<ConnectionConfig>,
    /// Calculation strategy.
    pub calculator: CalculatorConfig,
    /// Reconnect a provider whose stream died after its retry budget.
    pub reconnect_on_loss: bool,
    /// Log level.
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            rates: vec![CurrencyPair::usd_try()],
            connections: Vec::new(),
            calculator: CalculatorConfig::default(),
            reconnect_on_loss: true,
            log_level: "info".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load configuration from environment variables.
    ///
    /// `RATEFEED_CONFIG` names a JSON file used as the base. `RATEFEED_RATES`
    /// (inline list) takes precedence over `RATEFEED_RATES_FILE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("RATEFEED_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(rates) = std::env::var("RATEFEED_RATES") {
            config.rates = parse_rate_list(&rates)?;
        } else if let Ok(path) = std::env::var("RATEFEED_RATES_FILE") {
            config.rates = load_rates(path)?;
        }

        if let Ok(node_id) = std::env::var("RATEFEED_NODE_ID") {
            config.node_id = Some(node_id);
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Connections that should be instantiated.
    pub fn enabled_connections(&self) -> impl Iterator<Item = &ConnectionConfig> {
        self.connections.iter().filter(|c| c.enabled)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.rates.is_empty() {
            return Err("Rates list cannot be empty".to_string());
        }

        let mut names = HashSet::new();
        for connection in &self.connections {
            if !names.insert(connection.name.as_str()) {
                return Err(format!("Duplicate connection name {:?}", connection.name));
            }
            connection.validate()?;
        }

        self.calculator.validate()?;

        Ok(())
    }
}

/// Read a rates list file: comma separated, one or more lines, `#` comments.
pub fn load_rates(path: impl AsRef<Path>) -> Result<Vec<CurrencyPair>, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let joined = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join(",");

    Ok(parse_rate_list(&joined)?)
}
