//! Grid level calculation
//!
//! Pure functions of their inputs: the optimizer calls these once per
//! candidate and the order manager again on every rebalance.

use crate::core::types::{GridConfig, GridLevel, LevelStatus, OrderSide, PriceBounds, SpacingMode};
use crate::error::{GridError, GridResult};

pub const MIN_GRID_COUNT: usize = 4;
pub const MAX_GRID_COUNT: usize = 100;

/// Spacing floor for `optimal_grid_count`, below this fees eat the per-fill profit
const MIN_SPACING_PCT: f64 = 0.002;

/// Round half away from zero at `decimals` places
pub fn round_half_up(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    // Nudge values like 2.675 that sit a hair under the half in binary
    let nudged = scaled.abs() + 0.5 + scaled.abs() * f64::EPSILON * 4.0;
    nudged.floor().copysign(scaled) / factor
}

/// Bounds after the optional ATR re-centring
pub fn effective_bounds(config: &GridConfig) -> GridResult<PriceBounds> {
    let bounds = config.bounds();
    match &config.atr_adjustment {
        None => Ok(bounds),
        Some(adj) => {
            let mid = bounds.mid();
            let half = adj.multiplier * adj.atr;
            let adjusted = PriceBounds::new(mid - half, mid + half);
            if adjusted.lower <= 0.0 {
                return Err(GridError::invalid_config(format!(
                    "ATR adjustment pushes lower bound to {:.8}",
                    adjusted.lower
                )));
            }
            Ok(adjusted)
        }
    }
}

/// Level prices for a spacing mode, strictly increasing, endpoints equal to the bounds
pub fn level_prices(
    spacing: SpacingMode,
    bounds: PriceBounds,
    count: usize,
    precision: u32,
) -> GridResult<Vec<f64>> {
    if count < 2 {
        return Err(GridError::invalid_config(format!(
            "level_count must be at least 2, got {}",
            count
        )));
    }
    if !(bounds.lower > 0.0 && bounds.upper > bounds.lower) {
        return Err(GridError::invalid_config(format!(
            "invalid bounds [{}, {}]",
            bounds.lower, bounds.upper
        )));
    }

    let last = count - 1;
    let step = bounds.width() / last as f64;
    let ratio = (bounds.upper / bounds.lower).powf(1.0 / last as f64);

    let mut prices = Vec::with_capacity(count);
    for i in 0..count {
        let raw = if i == 0 {
            bounds.lower
        } else if i == last {
            bounds.upper
        } else {
            match spacing {
                SpacingMode::Arithmetic => bounds.lower + i as f64 * step,
                SpacingMode::Geometric => bounds.lower * ratio.powi(i as i32),
            }
        };
        prices.push(round_half_up(raw, precision));
    }

    if let Some(pair) = prices.windows(2).find(|w| w[1] <= w[0]) {
        return Err(GridError::invalid_config(format!(
            "grid spacing below price precision ({} decimals): levels {} and {} collapse",
            precision, pair[0], pair[1]
        )));
    }

    Ok(prices)
}

/// Compute the ordered grid levels for a configuration.
///
/// Sides are relative to the midpoint of the bounds; the order manager
/// reassigns them against the live price when it places orders.
pub fn compute_levels(config: &GridConfig) -> GridResult<Vec<GridLevel>> {
    config.validate()?;
    let bounds = effective_bounds(config)?;
    let prices = level_prices(config.spacing, bounds, config.level_count, config.price_precision)?;
    let mid = bounds.mid();

    Ok(prices
        .into_iter()
        .enumerate()
        .map(|(index, price)| GridLevel {
            index,
            price,
            side: if price < mid { OrderSide::Buy } else { OrderSide::Sell },
            size: config.order_size,
            status: LevelStatus::Pending,
        })
        .collect())
}

/// Heuristic level count for a volatility measure (ATR as a fraction of price).
///
/// Targets a spacing of half the volatility so a typical candle crosses a
/// level or two, while keeping each step above the fee floor.
pub fn optimal_grid_count(volatility: f64, bounds: PriceBounds) -> usize {
    if !volatility.is_finite() || volatility <= 0.0 {
        return MIN_GRID_COUNT;
    }
    if !(bounds.lower > 0.0 && bounds.upper > bounds.lower) {
        return MIN_GRID_COUNT;
    }

    let range_pct = bounds.width() / bounds.mid();
    let target_spacing = (volatility * 0.5).max(MIN_SPACING_PCT);
    let intervals = (range_pct / target_spacing).round() as usize;

    (intervals + 1).clamp(MIN_GRID_COUNT, MAX_GRID_COUNT)
}

/// Same-shaped bounds centred on a new price: same width for arithmetic
/// grids, same ratio for geometric ones (and for arithmetic grids that would
/// otherwise cross zero).
pub fn recentred_bounds(spacing: SpacingMode, bounds: PriceBounds, center: f64) -> PriceBounds {
    let half = bounds.width() / 2.0;
    if spacing == SpacingMode::Arithmetic && center - half > 0.0 {
        return PriceBounds::new(center - half, center + half);
    }
    let ratio = (bounds.upper / bounds.lower).sqrt();
    PriceBounds::new(center / ratio, center * ratio)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_half_up() {
        assert_eq!(round_half_up(2.675, 2), 2.68);
        assert_eq!(round_half_up(1.005, 2), 1.01);
        assert_eq!(round_half_up(99.994, 2), 99.99);
        assert_eq!(round_half_up(100.0, 0), 100.0);
    }

    #[test]
    fn test_arithmetic_levels() {
        let config = GridConfig::new(90.0, 110.0, 5, 1.0);
        let prices: Vec<f64> = compute_levels(&config).unwrap().iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![90.0, 95.0, 100.0, 105.0, 110.0]);
    }

    #[test]
    fn test_sides_split_at_mid() {
        let config = GridConfig::new(90.0, 110.0, 5, 1.0);
        let levels = compute_levels(&config).unwrap();
        assert_eq!(levels[0].side, OrderSide::Buy);
        assert_eq!(levels[1].side, OrderSide::Buy);
        assert_eq!(levels[2].side, OrderSide::Sell);
        assert_eq!(levels[4].side, OrderSide::Sell);
    }

    #[test]
    fn test_geometric_levels_constant_ratio() {
        let config = GridConfig::new(100.0, 200.0, 8, 1.0).with_spacing(SpacingMode::Geometric);
        let levels = compute_levels(&config).unwrap();
        let ratio = levels[1].price / levels[0].price;
        for w in levels.windows(2) {
            assert!((w[1].price / w[0].price - ratio).abs() < 1e-6);
        }
        assert_eq!(levels[0].price, 100.0);
        assert_eq!(levels[7].price, 200.0);
    }

    #[test]
    fn test_atr_adjustment_recentres_bounds() {
        let config = GridConfig::new(90.0, 110.0, 5, 1.0).with_atr_adjustment(2.0, 3.0);
        let levels = compute_levels(&config).unwrap();
        assert_eq!(levels.first().unwrap().price, 94.0);
        assert_eq!(levels.last().unwrap().price, 106.0);
    }

    #[test]
    fn test_atr_adjustment_below_zero_rejected() {
        let config = GridConfig::new(90.0, 110.0, 5, 1.0).with_atr_adjustment(50.0, 3.0);
        assert!(matches!(compute_levels(&config), Err(GridError::InvalidConfig(_))));
    }

    #[test]
    fn test_precision_collapse_rejected() {
        let config = GridConfig::new(100.0, 101.0, 20, 1.0).with_precision(0);
        assert!(matches!(compute_levels(&config), Err(GridError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(compute_levels(&GridConfig::new(110.0, 110.0, 5, 1.0)).is_err());
        assert!(compute_levels(&GridConfig::new(90.0, 110.0, 1, 1.0)).is_err());
        assert!(compute_levels(&GridConfig::new(90.0, 110.0, 5, -1.0)).is_err());
    }

    #[test]
    fn test_optimal_grid_count_deterministic() {
        let bounds = PriceBounds::new(90.0, 110.0);
        let a = optimal_grid_count(0.02, bounds);
        let b = optimal_grid_count(0.02, bounds);
        assert_eq!(a, b);
        // 20% range, 1% target spacing
        assert_eq!(a, 21);
    }

    #[test]
    fn test_optimal_grid_count_more_volatility_fewer_levels() {
        let bounds = PriceBounds::new(90.0, 110.0);
        assert!(optimal_grid_count(0.08, bounds) < optimal_grid_count(0.02, bounds));
        assert_eq!(optimal_grid_count(0.0, bounds), MIN_GRID_COUNT);
        assert_eq!(optimal_grid_count(0.0001, PriceBounds::new(10.0, 1000.0)), MAX_GRID_COUNT);
    }

    #[test]
    fn test_recentred_bounds() {
        let bounds = PriceBounds::new(90.0, 110.0);
        let moved = recentred_bounds(SpacingMode::Arithmetic, bounds, 130.0);
        assert_eq!(moved, PriceBounds::new(120.0, 140.0));

        let geo = recentred_bounds(SpacingMode::Geometric, PriceBounds::new(100.0, 400.0), 50.0);
        assert!((geo.lower - 25.0).abs() < 1e-9);
        assert!((geo.upper - 100.0).abs() < 1e-9);
    }
}
