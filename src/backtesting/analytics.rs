// Performance Analytics and Metrics Calculation

use chrono::{DateTime, Utc};
use ndarray::{s, Array1};

use crate::backtesting::{EquityPoint, FillEvent, GridCycle, PerformanceMetrics};

const SECONDS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0;

pub struct PerformanceAnalyzer {
    risk_free_rate: f64, // Annual risk-free rate for Sharpe calculation
}

impl PerformanceAnalyzer {
    pub fn new() -> Self {
        Self {
            risk_free_rate: 0.02, // 2% annual risk-free rate
        }
    }

    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.risk_free_rate = rate;
        self
    }

    /// Calculate metrics for a finished run.
    ///
    /// The equity series always starts at `initial_capital`, so a run without
    /// fills reports zero return and zero drawdown.
    pub fn calculate_metrics(
        &self,
        equity_curve: &[EquityPoint],
        fills: &[FillEvent],
        cycles: &[GridCycle],
        initial_capital: f64,
        peak_capital_deployed: f64,
    ) -> PerformanceMetrics {
        let equity: Array1<f64> = std::iter::once(initial_capital)
            .chain(equity_curve.iter().map(|p| p.equity))
            .collect();
        let final_equity = equity[equity.len() - 1];
        let net_pnl = final_equity - initial_capital;

        let realized_pnl: f64 = cycles.iter().map(|c| c.realized_pnl).sum();
        let winning_cycles = cycles.iter().filter(|c| c.realized_pnl > 0.0).count();
        let win_rate_pct = if cycles.is_empty() {
            0.0
        } else {
            winning_cycles as f64 / cycles.len() as f64 * 100.0
        };
        let avg_cycle_duration_hours = if cycles.is_empty() {
            0.0
        } else {
            cycles.iter().map(|c| c.duration_secs as f64).sum::<f64>() / cycles.len() as f64 / 3600.0
        };

        let timestamps: Vec<DateTime<Utc>> = equity_curve.iter().map(|p| p.timestamp).collect();
        let periods_per_year = self.periods_per_year(&timestamps);
        let (sharpe_ratio, volatility_pct) = self.calculate_sharpe(&equity, periods_per_year);

        PerformanceMetrics {
            total_return_pct: net_pnl / initial_capital * 100.0,
            final_equity,
            realized_pnl,
            unrealized_pnl: net_pnl - realized_pnl,
            max_drawdown_pct: self.calculate_max_drawdown(&equity) * 100.0,
            sharpe_ratio,
            volatility_pct,
            peak_capital_deployed,
            capital_efficiency: if peak_capital_deployed > 0.0 {
                net_pnl / peak_capital_deployed
            } else {
                0.0
            },
            total_fills: fills.len(),
            completed_cycles: cycles.len(),
            winning_cycles,
            win_rate_pct,
            avg_cycle_duration_hours,
            total_fees_paid: fills.iter().map(|f| f.fee).sum(),
        }
    }

    /// Peak-to-trough decline as a fraction of the peak
    pub fn calculate_max_drawdown(&self, equity: &Array1<f64>) -> f64 {
        let mut peak = f64::MIN;
        let mut max_drawdown: f64 = 0.0;
        for &value in equity.iter() {
            peak = peak.max(value);
            if peak > 0.0 {
                max_drawdown = max_drawdown.max((peak - value) / peak);
            }
        }
        max_drawdown
    }

    /// Annualized Sharpe ratio and volatility (in percent) of per-period returns
    fn calculate_sharpe(&self, equity: &Array1<f64>, periods_per_year: f64) -> (f64, f64) {
        let n = equity.len();
        if n < 3 {
            return (0.0, 0.0);
        }

        let returns = &equity.slice(s![1..]) / &equity.slice(s![..n - 1]) - 1.0;
        let mean = returns.mean().unwrap_or(0.0);
        let std_dev = returns.std(1.0);
        if !std_dev.is_finite() || std_dev < 1e-12 {
            return (0.0, 0.0);
        }

        let rf_per_period = self.risk_free_rate / periods_per_year;
        let sharpe = (mean - rf_per_period) / std_dev * periods_per_year.sqrt();
        (sharpe, std_dev * periods_per_year.sqrt() * 100.0)
    }

    fn periods_per_year(&self, timestamps: &[DateTime<Utc>]) -> f64 {
        if timestamps.len() < 2 {
            return 365.0; // Default to daily
        }
        let total_secs = timestamps
            .windows(2)
            .map(|w| (w[1] - w[0]).num_seconds())
            .sum::<i64>();
        let avg_interval = total_secs as f64 / (timestamps.len() - 1) as f64;
        if avg_interval <= 0.0 {
            return 365.0;
        }
        SECONDS_PER_YEAR / avg_interval
    }
}

impl Default for PerformanceAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn curve(values: &[f64]) -> Vec<EquityPoint> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, &equity)| EquityPoint {
                timestamp: start + Duration::hours(i as i64),
                mark_price: 100.0,
                equity,
            })
            .collect()
    }

    #[test]
    fn test_max_drawdown() {
        let analyzer = PerformanceAnalyzer::new();
        let equity = Array1::from_vec(vec![100.0, 120.0, 90.0, 130.0, 117.0]);
        assert!((analyzer.calculate_max_drawdown(&equity) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_flat_run_has_zero_metrics() {
        let analyzer = PerformanceAnalyzer::new();
        let metrics = analyzer.calculate_metrics(&curve(&[1_000.0, 1_000.0, 1_000.0]), &[], &[], 1_000.0, 0.0);
        assert_eq!(metrics.total_return_pct, 0.0);
        assert_eq!(metrics.max_drawdown_pct, 0.0);
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert_eq!(metrics.capital_efficiency, 0.0);
    }

    #[test]
    fn test_return_and_efficiency() {
        let analyzer = PerformanceAnalyzer::new();
        let metrics = analyzer.calculate_metrics(&curve(&[1_000.0, 1_010.0, 1_050.0]), &[], &[], 1_000.0, 200.0);
        assert!((metrics.total_return_pct - 5.0).abs() < 1e-9);
        assert!((metrics.capital_efficiency - 0.25).abs() < 1e-9);
        assert!(metrics.sharpe_ratio > 0.0);
    }

    #[test]
    fn test_hourly_annualization() {
        let analyzer = PerformanceAnalyzer::new();
        let points = curve(&[1.0, 2.0, 3.0]);
        let timestamps: Vec<_> = points.iter().map(|p| p.timestamp).collect();
        assert!((analyzer.periods_per_year(&timestamps) - 8_766.0).abs() < 1e-6);
    }
}
