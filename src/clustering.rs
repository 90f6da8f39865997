//! Volatility clusters for narrowing the optimizer's search space.
//!
//! Instruments are grouped by how violently they move, and each group gets a
//! static preset of grid parameter ranges. Searching inside the preset keeps
//! the candidate count small and avoids grids that cannot work for the
//! instrument (e.g. a 2% wide grid on a coin that moves 15% a day).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::{Candle, SpacingMode};
use crate::error::{GridError, GridResult};

/// Volatility statistics of one instrument over a candle window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinProfile {
    pub symbol: String,
    /// Average true range as a fraction of the last close
    pub atr_pct: f64,
    /// Mean per-candle volume
    pub avg_volume: f64,
    /// Mean |open - previous close| as a fraction of the previous close
    pub typical_gap_pct: f64,
    pub samples: usize,
}

impl CoinProfile {
    /// Build a profile from the well-formed candles of a window.
    /// The ATR is a simple mean of the last `atr_period` true ranges.
    pub fn from_candles(symbol: impl Into<String>, candles: &[Candle], atr_period: usize) -> GridResult<Self> {
        if atr_period == 0 {
            return Err(GridError::invalid_config("atr_period must be at least 1"));
        }
        let usable: Vec<&Candle> = candles.iter().filter(|c| c.is_well_formed()).collect();
        let last = match usable.last() {
            Some(c) => c,
            None => return Err(GridError::invalid_profile("empty price history window")),
        };

        let mut true_ranges = Vec::with_capacity(usable.len());
        let mut gaps = Vec::with_capacity(usable.len());
        for (i, candle) in usable.iter().enumerate() {
            let range = candle.high - candle.low;
            if i == 0 {
                true_ranges.push(range);
                continue;
            }
            let prev_close = usable[i - 1].close;
            true_ranges.push(
                range
                    .max((candle.high - prev_close).abs())
                    .max((candle.low - prev_close).abs()),
            );
            gaps.push((candle.open - prev_close).abs() / prev_close);
        }

        let window = &true_ranges[true_ranges.len().saturating_sub(atr_period)..];
        let atr = window.iter().sum::<f64>() / window.len() as f64;
        let typical_gap_pct = if gaps.is_empty() {
            0.0
        } else {
            gaps.iter().sum::<f64>() / gaps.len() as f64
        };

        Ok(Self {
            symbol: symbol.into(),
            atr_pct: atr / last.close,
            avg_volume: usable.iter().map(|c| c.volume).sum::<f64>() / usable.len() as f64,
            typical_gap_pct,
            samples: usable.len(),
        })
    }

    fn validate(&self) -> GridResult<()> {
        if self.samples == 0 {
            return Err(GridError::invalid_profile("empty price history window"));
        }
        if !self.atr_pct.is_finite() || self.atr_pct < 0.0 {
            return Err(GridError::invalid_profile(format!(
                "{}: ATR% must be a non-negative number, got {}",
                self.symbol, self.atr_pct
            )));
        }
        if !self.avg_volume.is_finite() || self.avg_volume < 0.0 {
            return Err(GridError::invalid_profile(format!(
                "{}: average volume must be a non-negative number, got {}",
                self.symbol, self.avg_volume
            )));
        }
        if !self.typical_gap_pct.is_finite() || self.typical_gap_pct < 0.0 {
            return Err(GridError::invalid_profile(format!(
                "{}: gap % must be a non-negative number, got {}",
                self.symbol, self.typical_gap_pct
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CoinCluster {
    LowVolatility,
    MediumVolatility,
    HighVolatility,
    ExtremeVolatility,
}

impl CoinCluster {
    pub const ALL: [CoinCluster; 4] = [
        CoinCluster::LowVolatility,
        CoinCluster::MediumVolatility,
        CoinCluster::HighVolatility,
        CoinCluster::ExtremeVolatility,
    ];

    /// Identifier used in the CLI and config (e.g. "high")
    pub fn id(&self) -> &'static str {
        match self {
            CoinCluster::LowVolatility => "low",
            CoinCluster::MediumVolatility => "medium",
            CoinCluster::HighVolatility => "high",
            CoinCluster::ExtremeVolatility => "extreme",
        }
    }

    /// Returns the cluster whose `id` matches (case-insensitive), or None.
    pub fn from_id(id: &str) -> Option<CoinCluster> {
        let id_lower = id.to_lowercase();
        Self::ALL.into_iter().find(|c| c.id() == id_lower)
    }

    fn one_tier_up(self) -> CoinCluster {
        match self {
            CoinCluster::LowVolatility => CoinCluster::MediumVolatility,
            CoinCluster::MediumVolatility => CoinCluster::HighVolatility,
            CoinCluster::HighVolatility | CoinCluster::ExtremeVolatility => CoinCluster::ExtremeVolatility,
        }
    }
}

impl fmt::Display for CoinCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// ATR% cut points between tiers and the thin-volume threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterThresholds {
    pub medium_atr_pct: f64,
    pub high_atr_pct: f64,
    pub extreme_atr_pct: f64,
    /// Average volume below this bumps the cluster one tier up
    pub thin_volume: f64,
}

impl Default for ClusterThresholds {
    fn default() -> Self {
        Self {
            medium_atr_pct: 0.015,
            high_atr_pct: 0.04,
            extreme_atr_pct: 0.08,
            thin_volume: 100.0,
        }
    }
}

impl ClusterThresholds {
    pub fn validate(&self) -> GridResult<()> {
        let cuts = [self.medium_atr_pct, self.high_atr_pct, self.extreme_atr_pct];
        if cuts.iter().any(|c| !c.is_finite() || *c <= 0.0) {
            return Err(GridError::invalid_config("cluster ATR thresholds must be positive"));
        }
        if !(self.medium_atr_pct < self.high_atr_pct && self.high_atr_pct < self.extreme_atr_pct) {
            return Err(GridError::invalid_config(format!(
                "cluster ATR thresholds must increase: {} < {} < {}",
                self.medium_atr_pct, self.high_atr_pct, self.extreme_atr_pct
            )));
        }
        if !self.thin_volume.is_finite() || self.thin_volume < 0.0 {
            return Err(GridError::invalid_config("thin_volume must be non-negative"));
        }
        Ok(())
    }
}

/// Classify an instrument. Total over valid profiles: every non-negative
/// ATR% lands in exactly one tier.
pub fn classify(profile: &CoinProfile, thresholds: Option<&ClusterThresholds>) -> GridResult<CoinCluster> {
    let defaults = ClusterThresholds::default();
    let t = thresholds.unwrap_or(&defaults);
    t.validate()?;
    profile.validate()?;

    let by_atr = if profile.atr_pct < t.medium_atr_pct {
        CoinCluster::LowVolatility
    } else if profile.atr_pct < t.high_atr_pct {
        CoinCluster::MediumVolatility
    } else if profile.atr_pct < t.extreme_atr_pct {
        CoinCluster::HighVolatility
    } else {
        CoinCluster::ExtremeVolatility
    };

    if profile.avg_volume < t.thin_volume {
        Ok(by_atr.one_tier_up())
    } else {
        Ok(by_atr)
    }
}

/// Recommended search ranges for one cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterPreset {
    pub cluster: CoinCluster,
    pub label: &'static str,
    pub spacing_modes: &'static [SpacingMode],
    pub level_counts: &'static [usize],
    /// Total grid width as a fraction of the anchor price
    pub bound_widths: &'static [f64],
    pub fine_level_step: usize,
    pub fine_width_step: f64,
}

const BOTH_MODES: &[SpacingMode] = &[SpacingMode::Arithmetic, SpacingMode::Geometric];

pub fn preset_for(cluster: CoinCluster) -> ClusterPreset {
    match cluster {
        CoinCluster::LowVolatility => ClusterPreset {
            cluster,
            label: "Low volatility (tight, dense grids)",
            spacing_modes: &[SpacingMode::Arithmetic],
            level_counts: &[10, 20, 30],
            bound_widths: &[0.04, 0.08, 0.12],
            fine_level_step: 2,
            fine_width_step: 0.01,
        },
        CoinCluster::MediumVolatility => ClusterPreset {
            cluster,
            label: "Medium volatility",
            spacing_modes: BOTH_MODES,
            level_counts: &[8, 14, 20],
            bound_widths: &[0.10, 0.16, 0.22],
            fine_level_step: 2,
            fine_width_step: 0.02,
        },
        CoinCluster::HighVolatility => ClusterPreset {
            cluster,
            label: "High volatility (wide grids)",
            spacing_modes: BOTH_MODES,
            level_counts: &[6, 10, 14],
            bound_widths: &[0.20, 0.30, 0.40],
            fine_level_step: 1,
            fine_width_step: 0.04,
        },
        CoinCluster::ExtremeVolatility => ClusterPreset {
            cluster,
            label: "Extreme volatility (sparse geometric grids)",
            spacing_modes: &[SpacingMode::Geometric],
            level_counts: &[4, 8, 12],
            bound_widths: &[0.40, 0.60, 0.80],
            fine_level_step: 1,
            fine_width_step: 0.08,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn profile(atr_pct: f64, avg_volume: f64) -> CoinProfile {
        CoinProfile {
            symbol: "TEST/USDT".to_string(),
            atr_pct,
            avg_volume,
            typical_gap_pct: 0.0,
            samples: 100,
        }
    }

    #[test]
    fn test_tiers() {
        assert_eq!(classify(&profile(0.01, 1e6), None).unwrap(), CoinCluster::LowVolatility);
        assert_eq!(classify(&profile(0.02, 1e6), None).unwrap(), CoinCluster::MediumVolatility);
        assert_eq!(classify(&profile(0.05, 1e6), None).unwrap(), CoinCluster::HighVolatility);
        assert_eq!(classify(&profile(0.5, 1e6), None).unwrap(), CoinCluster::ExtremeVolatility);
    }

    #[test]
    fn test_thin_volume_bumps_tier() {
        assert_eq!(classify(&profile(0.01, 10.0), None).unwrap(), CoinCluster::MediumVolatility);
        assert_eq!(classify(&profile(0.5, 10.0), None).unwrap(), CoinCluster::ExtremeVolatility);
    }

    #[test]
    fn test_invalid_profiles() {
        assert!(matches!(classify(&profile(-0.01, 1e6), None), Err(GridError::InvalidProfile(_))));
        assert!(matches!(classify(&profile(f64::NAN, 1e6), None), Err(GridError::InvalidProfile(_))));
        assert!(matches!(classify(&profile(0.01, f64::INFINITY), None), Err(GridError::InvalidProfile(_))));

        let mut empty = profile(0.01, 1e6);
        empty.samples = 0;
        assert!(matches!(classify(&empty, None), Err(GridError::InvalidProfile(_))));
    }

    #[test]
    fn test_non_increasing_thresholds_rejected() {
        let thresholds = ClusterThresholds {
            medium_atr_pct: 0.05,
            high_atr_pct: 0.04,
            ..ClusterThresholds::default()
        };
        assert!(matches!(
            classify(&profile(0.01, 1e6), Some(&thresholds)),
            Err(GridError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_profile_from_candles() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles: Vec<Candle> = (0..5)
            .map(|i| Candle::new(start + Duration::hours(i), 100.0, 102.0, 98.0, 100.0, 500.0))
            .collect();
        let p = CoinProfile::from_candles("TEST/USDT", &candles, 14).unwrap();
        assert!((p.atr_pct - 0.04).abs() < 1e-12);
        assert_eq!(p.avg_volume, 500.0);
        assert_eq!(p.typical_gap_pct, 0.0);
        assert_eq!(p.samples, 5);
    }

    #[test]
    fn test_empty_window_rejected() {
        assert!(matches!(
            CoinProfile::from_candles("TEST/USDT", &[], 14),
            Err(GridError::InvalidProfile(_))
        ));
    }

    #[test]
    fn test_every_cluster_has_a_usable_preset() {
        for cluster in CoinCluster::ALL {
            let preset = preset_for(cluster);
            assert_eq!(preset.cluster, cluster);
            assert!(!preset.spacing_modes.is_empty());
            assert!(preset.level_counts.iter().all(|&n| n >= 2));
            assert!(preset.bound_widths.iter().all(|&w| w > 0.0 && w < 2.0));
        }
    }

    #[test]
    fn test_cluster_ids() {
        assert_eq!(CoinCluster::from_id("HIGH"), Some(CoinCluster::HighVolatility));
        assert_eq!(CoinCluster::from_id("nope"), None);
    }
}
