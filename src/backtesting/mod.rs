// Backtesting data structures and types

pub mod analytics;
pub mod engine;

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::core::order_manager::{FeeModel, FillEvent, FillModel, GridCycle, Termination};
use crate::core::types::{Candle, GridConfig, OrderSide};
use crate::error::{GridError, GridResult};

/// Half-open `[start, end)` window of candle timestamps
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbol: String,
    pub grid: GridConfig,
    pub initial_capital: f64,
    pub fees: FeeModel,
    pub fill_model: FillModel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    /// Stop once realized P&L reaches this percentage of initial capital
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit_pct: Option<f64>,
    /// Annual rate used by the Sharpe ratio
    pub risk_free_rate: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC/USDT".to_string(),
            grid: GridConfig::new(90.0, 110.0, 11, 1.0),
            initial_capital: 10_000.0,
            fees: FeeModel::default(),
            fill_model: FillModel::default(),
            time_range: None,
            take_profit_pct: None,
            risk_free_rate: 0.02,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> GridResult<()> {
        self.grid.validate()?;
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(GridError::invalid_config(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }
        self.fees.validate()?;
        self.fill_model.validate()?;
        if let Some(range) = &self.time_range {
            if range.start >= range.end {
                return Err(GridError::invalid_config("time range start must be before its end"));
            }
        }
        if let Some(pct) = self.take_profit_pct {
            if !pct.is_finite() || pct <= 0.0 {
                return Err(GridError::invalid_config("take_profit_pct must be positive"));
            }
        }
        if !self.risk_free_rate.is_finite() {
            return Err(GridError::invalid_config("risk_free_rate must be finite"));
        }
        Ok(())
    }

    /// Realized P&L threshold in quote currency derived from `take_profit_pct`
    pub fn take_profit_amount(&self) -> Option<f64> {
        self.take_profit_pct.map(|pct| self.initial_capital * pct / 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    /// Close of the candle the point was marked at
    pub mark_price: f64,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    // Returns
    pub total_return_pct: f64,
    pub final_equity: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,

    // Risk
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub volatility_pct: f64,

    // Capital usage
    pub peak_capital_deployed: f64,
    /// Net P&L over peak deployed notional
    pub capital_efficiency: f64,

    // Activity
    pub total_fills: usize,
    pub completed_cycles: usize,
    pub winning_cycles: usize,
    pub win_rate_pct: f64,
    pub avg_cycle_duration_hours: f64,
    pub total_fees_paid: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub grid_config: GridConfig,
    pub initial_capital: f64,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub equity_curve: Vec<EquityPoint>,
    pub fills: Vec<FillEvent>,
    pub cycles: Vec<GridCycle>,
    pub metrics: PerformanceMetrics,
    pub termination: Termination,
    pub skipped_candles: usize,
    pub rebalance_count: usize,
}

impl BacktestResult {
    /// Rebuild the equity curve from the fill log alone
    pub fn replay_equity(&self) -> Vec<f64> {
        let mut ledger = Ledger::new(self.initial_capital);
        let mut fills = self.fills.iter().peekable();

        self.equity_curve
            .iter()
            .map(|point| {
                while let Some(fill) = fills.next_if(|f| f.timestamp <= point.timestamp) {
                    ledger.apply(fill);
                }
                ledger.equity(point.mark_price)
            })
            .collect()
    }
}

/// Cash and net base-asset position; the single source of equity numbers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ledger {
    pub cash: f64,
    pub position: f64,
}

impl Ledger {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            position: 0.0,
        }
    }

    pub fn apply(&mut self, fill: &FillEvent) {
        match fill.side {
            OrderSide::Buy => {
                self.cash -= fill.price * fill.size + fill.fee;
                self.position += fill.size;
            }
            OrderSide::Sell => {
                self.cash += fill.price * fill.size - fill.fee;
                self.position -= fill.size;
            }
        }
    }

    pub fn equity(&self, mark_price: f64) -> f64 {
        self.cash + self.position * mark_price
    }
}

/// Load candles from a JSON array file
pub fn load_candles_json(path: impl AsRef<Path>) -> GridResult<Vec<Candle>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| GridError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
    let candles: Vec<Candle> = serde_json::from_str(&content)?;
    Ok(candles)
}
