// Backtesting engine: drives one grid over a candle series

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backtesting::analytics::PerformanceAnalyzer;
use crate::backtesting::{
    BacktestConfig, BacktestResult, EquityPoint, FeeModel, FillModel, Ledger, Termination, TimeRange,
};
use crate::core::order_manager::{GridOrderManager, ManagerSettings};
use crate::core::types::{Candle, GridConfig};
use crate::error::{GridError, GridResult};

pub struct BacktestEngine {
    config: BacktestConfig,
    performance_analyzer: PerformanceAnalyzer,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        let performance_analyzer = PerformanceAnalyzer::new().with_risk_free_rate(config.risk_free_rate);
        Self {
            config,
            performance_analyzer,
        }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Replay `candles` through a fresh order manager.
    ///
    /// Deterministic: the same config and candles give a bit-identical result.
    /// Malformed or out-of-order candles are skipped and counted; the grid is
    /// initialized at the open of the first usable candle.
    pub fn run(&self, candles: &[Candle]) -> GridResult<BacktestResult> {
        self.config.validate()?;

        let mut manager = GridOrderManager::new(ManagerSettings {
            capital: self.config.initial_capital,
            fees: self.config.fees.clone(),
            fill_model: self.config.fill_model.clone(),
            take_profit: self.config.take_profit_amount(),
        });
        let mut ledger = Ledger::new(self.config.initial_capital);

        let mut equity_curve = Vec::with_capacity(candles.len());
        let mut fills = Vec::new();
        let mut skipped_candles = 0;
        let mut peak_deployed: f64 = 0.0;
        let mut last_timestamp: Option<DateTime<Utc>> = None;
        let mut last_close = None;

        let in_range = |c: &&Candle| self.config.time_range.map_or(true, |r| r.contains(c.timestamp));

        for candle in candles.iter().filter(in_range) {
            if !candle.is_well_formed() {
                debug!("Skipping malformed candle at {}", candle.timestamp);
                skipped_candles += 1;
                continue;
            }
            if last_timestamp.map_or(false, |t| candle.timestamp <= t) {
                debug!("Skipping out-of-order candle at {}", candle.timestamp);
                skipped_candles += 1;
                continue;
            }

            if last_timestamp.is_none() {
                manager.initialize(self.config.grid.clone(), candle.open, candle.timestamp)?;
            }
            last_timestamp = Some(candle.timestamp);
            last_close = Some(candle.close);

            let candle_fills = manager.on_price(candle)?;
            for fill in &candle_fills {
                ledger.apply(fill);
            }
            fills.extend(candle_fills);

            peak_deployed = peak_deployed.max(manager.open_exposure());
            equity_curve.push(EquityPoint {
                timestamp: candle.timestamp,
                mark_price: candle.close,
                equity: ledger.equity(candle.close),
            });

            if manager.termination().is_some() {
                break;
            }
        }

        if last_close.is_none() {
            return Err(GridError::InsufficientData(format!(
                "no usable candles for {} ({} given, {} skipped)",
                self.config.symbol,
                candles.len(),
                skipped_candles
            )));
        }
        if skipped_candles > 0 {
            warn!("⚠️  Skipped {} malformed or out-of-order candles", skipped_candles);
        }

        let cycles = manager.cycle_log().to_vec();
        let metrics = self.performance_analyzer.calculate_metrics(
            &equity_curve,
            &fills,
            &cycles,
            self.config.initial_capital,
            peak_deployed,
        );
        let termination = manager.termination().cloned().unwrap_or(Termination::Completed);

        info!(
            "📊 Backtest {}: return {:.2}%, {} cycles, {} fills, max drawdown {:.2}%",
            self.config.symbol,
            metrics.total_return_pct,
            metrics.completed_cycles,
            metrics.total_fills,
            metrics.max_drawdown_pct
        );

        Ok(BacktestResult {
            symbol: self.config.symbol.clone(),
            grid_config: self.config.grid.clone(),
            initial_capital: self.config.initial_capital,
            start_date: equity_curve.first().map(|p| p.timestamp),
            end_date: equity_curve.last().map(|p| p.timestamp),
            equity_curve,
            fills,
            cycles,
            metrics,
            termination,
            skipped_candles,
            rebalance_count: manager.rebalance_count(),
        })
    }
}

pub struct BacktestBuilder {
    config: BacktestConfig,
}

impl BacktestBuilder {
    pub fn new() -> Self {
        Self {
            config: BacktestConfig::default(),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.config.symbol = symbol.into();
        self
    }

    pub fn with_grid(mut self, grid: GridConfig) -> Self {
        self.config.grid = grid;
        self
    }

    pub fn with_initial_capital(mut self, capital: f64) -> Self {
        self.config.initial_capital = capital;
        self
    }

    pub fn with_fees(mut self, fees: FeeModel) -> Self {
        self.config.fees = fees;
        self
    }

    pub fn with_fill_model(mut self, fill_model: FillModel) -> Self {
        self.config.fill_model = fill_model;
        self
    }

    pub fn with_time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.config.time_range = Some(TimeRange { start, end });
        self
    }

    pub fn with_take_profit_pct(mut self, pct: f64) -> Self {
        self.config.take_profit_pct = Some(pct);
        self
    }

    pub fn build(self) -> BacktestEngine {
        BacktestEngine::new(self.config)
    }
}

impl Default for BacktestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
