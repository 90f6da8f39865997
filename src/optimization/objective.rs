// Objective functions for ranking optimizer trials

use serde::{Deserialize, Serialize};

use crate::backtesting::BacktestResult;

/// Turns a finished backtest into a single comparable number; higher is better
pub trait Scorer {
    fn score(&self, result: &BacktestResult) -> f64;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Objective {
    /// Total return in percent of initial capital
    TotalReturn,
    /// Net P&L per unit of peak deployed notional, in percent
    CapitalEfficiency,
    /// Total return minus `penalty` times the max drawdown (both in percent)
    DrawdownPenalized { penalty: f64 },
}

impl Default for Objective {
    fn default() -> Self {
        Objective::DrawdownPenalized { penalty: 0.5 }
    }
}

impl Scorer for Objective {
    fn score(&self, result: &BacktestResult) -> f64 {
        let m = &result.metrics;
        match self {
            Objective::TotalReturn => m.total_return_pct,
            Objective::CapitalEfficiency => m.capital_efficiency * 100.0,
            Objective::DrawdownPenalized { penalty } => m.total_return_pct - penalty * m.max_drawdown_pct,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Objective::TotalReturn => "total_return",
            Objective::CapitalEfficiency => "capital_efficiency",
            Objective::DrawdownPenalized { .. } => "drawdown_penalized",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtesting::{PerformanceMetrics, Termination};
    use crate::core::types::GridConfig;

    fn result(total_return_pct: f64, max_drawdown_pct: f64, capital_efficiency: f64) -> BacktestResult {
        BacktestResult {
            symbol: "TEST/USDT".to_string(),
            grid_config: GridConfig::new(90.0, 110.0, 5, 1.0),
            initial_capital: 1_000.0,
            start_date: None,
            end_date: None,
            equity_curve: Vec::new(),
            fills: Vec::new(),
            cycles: Vec::new(),
            metrics: PerformanceMetrics {
                total_return_pct,
                max_drawdown_pct,
                capital_efficiency,
                ..PerformanceMetrics::default()
            },
            termination: Termination::Completed,
            skipped_candles: 0,
            rebalance_count: 0,
        }
    }

    #[test]
    fn test_objectives() {
        let r = result(10.0, 4.0, 0.2);
        assert_eq!(Objective::TotalReturn.score(&r), 10.0);
        assert!((Objective::CapitalEfficiency.score(&r) - 20.0).abs() < 1e-12);
        assert_eq!(Objective::DrawdownPenalized { penalty: 0.5 }.score(&r), 8.0);
    }

    #[test]
    fn test_objective_toml_shape() {
        let toml_str = "kind = \"drawdown_penalized\"\npenalty = 1.5\n";
        let objective: Objective = toml::from_str(toml_str).unwrap();
        assert_eq!(objective, Objective::DrawdownPenalized { penalty: 1.5 });
        assert_eq!(objective.name(), "drawdown_penalized");
    }
}
