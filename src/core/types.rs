// Common types shared by the grid calculator, order manager and backtester

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GridError, GridResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpacingMode {
    Arithmetic, // Constant price distance between levels
    Geometric,  // Constant ratio between levels
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBounds {
    pub lower: f64,
    pub upper: f64,
}

impl PriceBounds {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn mid(&self) -> f64 {
        (self.lower + self.upper) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.lower && price <= self.upper
    }
}

/// Re-centre the grid bounds on `mid ± multiplier * atr` before generating levels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AtrAdjustment {
    pub atr: f64,
    pub multiplier: f64,
}

fn default_precision() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

/// Grid definition for one backtest run. Treated as immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub spacing: SpacingMode,
    pub lower_price: f64,
    pub upper_price: f64,
    pub level_count: usize,
    /// Base-asset quantity per level
    pub order_size: f64,
    /// Decimal places prices are rounded to
    #[serde(default = "default_precision")]
    pub price_precision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr_adjustment: Option<AtrAdjustment>,
    /// Realized P&L (quote currency) at which the run stops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    /// Regenerate the grid around price when a candle closes outside the bounds
    #[serde(default = "default_true")]
    pub rebalance_on_exit: bool,
}

impl GridConfig {
    pub fn new(lower_price: f64, upper_price: f64, level_count: usize, order_size: f64) -> Self {
        Self {
            spacing: SpacingMode::Arithmetic,
            lower_price,
            upper_price,
            level_count,
            order_size,
            price_precision: default_precision(),
            atr_adjustment: None,
            take_profit: None,
            rebalance_on_exit: true,
        }
    }

    pub fn with_spacing(mut self, spacing: SpacingMode) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn with_precision(mut self, decimals: u32) -> Self {
        self.price_precision = decimals;
        self
    }

    pub fn with_atr_adjustment(mut self, atr: f64, multiplier: f64) -> Self {
        self.atr_adjustment = Some(AtrAdjustment { atr, multiplier });
        self
    }

    pub fn with_take_profit(mut self, threshold: f64) -> Self {
        self.take_profit = Some(threshold);
        self
    }

    pub fn with_rebalance(mut self, enabled: bool) -> Self {
        self.rebalance_on_exit = enabled;
        self
    }

    pub fn bounds(&self) -> PriceBounds {
        PriceBounds::new(self.lower_price, self.upper_price)
    }

    pub fn validate(&self) -> GridResult<()> {
        if !self.lower_price.is_finite() || !self.upper_price.is_finite() {
            return Err(GridError::invalid_config("grid bounds must be finite"));
        }
        if self.lower_price <= 0.0 {
            return Err(GridError::invalid_config(format!(
                "lower_price must be positive, got {}",
                self.lower_price
            )));
        }
        if self.upper_price <= self.lower_price {
            return Err(GridError::invalid_config(format!(
                "upper_price ({}) must exceed lower_price ({})",
                self.upper_price, self.lower_price
            )));
        }
        if self.level_count < 2 {
            return Err(GridError::invalid_config(format!(
                "level_count must be at least 2, got {}",
                self.level_count
            )));
        }
        if !self.order_size.is_finite() || self.order_size <= 0.0 {
            return Err(GridError::invalid_config(format!(
                "order_size must be positive, got {}",
                self.order_size
            )));
        }
        if self.price_precision > 12 {
            return Err(GridError::invalid_config("price_precision must be at most 12 decimals"));
        }
        if let Some(adj) = &self.atr_adjustment {
            if !adj.atr.is_finite() || adj.atr <= 0.0 {
                return Err(GridError::invalid_config("ATR value must be positive"));
            }
            if !adj.multiplier.is_finite() || adj.multiplier <= 0.0 {
                return Err(GridError::invalid_config("ATR multiplier must be positive"));
            }
        }
        if let Some(tp) = self.take_profit {
            if !tp.is_finite() || tp <= 0.0 {
                return Err(GridError::invalid_config("take_profit must be positive"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelStatus {
    Pending,       // Opening order resting at the level
    Filled,        // Opening order filled, no counter yet
    CounterPlaced, // Counter-order resting at the adjacent level
    Cancelled,     // Removed by a rebalance
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: usize,
    pub price: f64,
    pub side: OrderSide,
    pub size: f64,
    pub status: LevelStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self { timestamp, open, high, low, close, volume }
    }

    /// Missing or corrupt data: non-finite or non-positive prices, or an inconsistent range
    pub fn is_well_formed(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return false;
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return false;
        }
        self.high >= self.low
            && self.open <= self.high
            && self.open >= self.low
            && self.close <= self.high
            && self.close >= self.low
    }

    /// Price path assumed inside the candle: bullish candles visit the low first
    pub fn sweep_path(&self) -> [f64; 4] {
        if self.close >= self.open {
            [self.open, self.low, self.high, self.close]
        } else {
            [self.open, self.high, self.low, self.close]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let config = GridConfig::new(110.0, 90.0, 5, 1.0);
        assert!(matches!(config.validate(), Err(GridError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_single_level() {
        let config = GridConfig::new(90.0, 110.0, 1, 1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_size() {
        let config = GridConfig::new(90.0, 110.0, 5, 0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sweep_path_direction() {
        let ts = Utc::now();
        let bullish = Candle::new(ts, 100.0, 106.0, 95.0, 104.0, 1.0);
        assert_eq!(bullish.sweep_path(), [100.0, 95.0, 106.0, 104.0]);

        let bearish = Candle::new(ts, 100.0, 106.0, 95.0, 97.0, 1.0);
        assert_eq!(bearish.sweep_path(), [100.0, 106.0, 95.0, 97.0]);
    }

    #[test]
    fn test_malformed_candle() {
        let ts = Utc::now();
        assert!(!Candle::new(ts, 100.0, 90.0, 95.0, 97.0, 1.0).is_well_formed());
        assert!(!Candle::new(ts, f64::NAN, 106.0, 95.0, 97.0, 1.0).is_well_formed());
        assert!(Candle::new(ts, 100.0, 106.0, 95.0, 97.0, 0.0).is_well_formed());
    }
}
