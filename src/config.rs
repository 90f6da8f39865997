// Configuration management for the grid backtester and optimizer
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::backtesting::{BacktestConfig, FeeModel, FillModel};
use crate::clustering::ClusterThresholds;
use crate::core::types::GridConfig;
use crate::optimization::OptimizerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestSettings {
    pub symbol: String,
    pub initial_capital: f64,
    pub risk_free_rate: f64, // Annual, for the Sharpe ratio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit_pct: Option<f64>,
    pub fees: FeeModel,
    pub fill_model: FillModel,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            symbol: "BTC/USDT".to_string(),
            initial_capital: 10_000.0,
            risk_free_rate: 0.02,
            take_profit_pct: None,
            fees: FeeModel::default(),
            fill_model: FillModel::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringSettings {
    pub atr_period: usize, // Candles averaged for the profile's ATR
    pub thresholds: ClusterThresholds,
}

impl Default for ClusteringSettings {
    fn default() -> Self {
        Self {
            atr_period: 14,
            thresholds: ClusterThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String, // error | warn | info | debug | trace
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/grid_optimizer.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub backtest: BacktestSettings,
    pub grid: GridConfig,
    #[serde(default)]
    pub optimization: OptimizerConfig,
    #[serde(default)]
    pub clustering: ClusteringSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backtest: BacktestSettings::default(),
            grid: GridConfig::new(90.0, 110.0, 11, 1.0),
            optimization: OptimizerConfig::default(),
            clustering: ClusteringSettings::default(),
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::FileRead(e.to_string()))?;
        let config: AppConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        fs::write(path, content).map_err(|e| ConfigError::FileWrite(e.to_string()))?;
        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.to_file(&path)?;
            info!("📁 Created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |e: crate::error::GridError| ConfigError::Validation(e.to_string());

        self.backtest_config().validate().map_err(invalid)?;
        self.optimization.validate().map_err(invalid)?;
        self.clustering.thresholds.validate().map_err(invalid)?;

        if self.clustering.atr_period == 0 {
            return Err(ConfigError::Validation("atr_period must be greater than 0".to_string()));
        }
        if !["error", "warn", "info", "debug", "trace"].contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "unknown logging level '{}'",
                self.logging.level
            )));
        }
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::Validation("database path must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn backtest_config(&self) -> BacktestConfig {
        BacktestConfig {
            symbol: self.backtest.symbol.clone(),
            grid: self.grid.clone(),
            initial_capital: self.backtest.initial_capital,
            fees: self.backtest.fees.clone(),
            fill_model: self.backtest.fill_model.clone(),
            time_range: None,
            take_profit_pct: self.backtest.take_profit_pct,
            risk_free_rate: self.backtest.risk_free_rate,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),
    #[error("Failed to write config file: {0}")]
    FileWrite(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Failed to serialize config: {0}")]
    Serialize(String),
    #[error("Configuration validation error: {0}")]
    Validation(String),
}
