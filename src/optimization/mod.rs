//! Grid parameter optimization
//!
//! A coarse cartesian search over a cluster preset, followed by a fine search
//! around the best coarse candidates. Each candidate is an independent
//! backtest; failed candidates are recorded as `TrialFailure` values and the
//! search carries on. Progress is checkpointed after every batch so a run can
//! be resumed or cancelled without losing completed work.

pub mod objective;
pub mod parameter_search;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backtesting::BacktestResult;
use crate::clustering::{ClusterPreset, CoinCluster};
use crate::core::types::SpacingMode;
use crate::error::{GridError, GridResult};

pub use objective::{Objective, Scorer};
pub use parameter_search::Optimizer;

/// Bound widths are compared at this resolution
const WIDTH_QUANTUM: f64 = 1e6;

pub fn quantize_width(width: f64) -> f64 {
    (width * WIDTH_QUANTUM).round() / WIDTH_QUANTUM
}

/// One point of the search space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub spacing: SpacingMode,
    pub level_count: usize,
    /// Total grid width as a fraction of the anchor price (0.2 = ±10%)
    pub bound_width: f64,
}

impl Candidate {
    pub fn new(spacing: SpacingMode, level_count: usize, bound_width: f64) -> Self {
        Self {
            spacing,
            level_count,
            bound_width,
        }
    }

    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            spacing: self.spacing,
            level_count: self.level_count,
            width_micros: (self.bound_width * WIDTH_QUANTUM).round() as i64,
        }
    }

    pub fn label(&self) -> String {
        format!(
            "{:?} levels={} width={:.2}%",
            self.spacing,
            self.level_count,
            self.bound_width * 100.0
        )
    }
}

/// Hashable identity of a candidate, with the width quantized to millionths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateKey {
    pub spacing: SpacingMode,
    pub level_count: usize,
    pub width_micros: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub spacing_modes: Vec<SpacingMode>,
    pub level_counts: Vec<usize>,
    pub bound_widths: Vec<f64>,
    pub fine_level_step: usize,
    pub fine_width_step: f64,
}

impl SearchSpace {
    pub fn from_preset(preset: &ClusterPreset) -> Self {
        Self {
            spacing_modes: preset.spacing_modes.to_vec(),
            level_counts: preset.level_counts.to_vec(),
            bound_widths: preset.bound_widths.to_vec(),
            fine_level_step: preset.fine_level_step,
            fine_width_step: preset.fine_width_step,
        }
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.spacing_modes.is_empty() || self.level_counts.is_empty() || self.bound_widths.is_empty() {
            return Err(GridError::invalid_config(
                "search space needs at least one spacing mode, level count and bound width",
            ));
        }
        if !self.fine_width_step.is_finite() || self.fine_width_step < 0.0 {
            return Err(GridError::invalid_config("fine_width_step must be non-negative"));
        }
        Ok(())
    }

    /// Cartesian product of spacing modes, level counts and widths, in that nesting order
    pub fn coarse_candidates(&self) -> Vec<Candidate> {
        let mut candidates =
            Vec::with_capacity(self.spacing_modes.len() * self.level_counts.len() * self.bound_widths.len());
        for &spacing in &self.spacing_modes {
            for &level_count in &self.level_counts {
                for &width in &self.bound_widths {
                    candidates.push(Candidate::new(spacing, level_count, quantize_width(width)));
                }
            }
        }
        candidates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchPhase {
    Coarse,
    Fine,
    Complete,
    /// Stopped by the cancellation token; resuming restarts at the coarse phase and skips finished work
    Cancelled,
}

impl SearchPhase {
    pub fn label(&self) -> &'static str {
        match self {
            SearchPhase::Coarse => "coarse",
            SearchPhase::Fine => "fine",
            SearchPhase::Complete => "complete",
            SearchPhase::Cancelled => "cancelled",
        }
    }
}

/// Metric summary kept per trial; full results are only stored for the winner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub capital_efficiency: f64,
    pub sharpe_ratio: f64,
    pub completed_cycles: usize,
    pub total_fills: usize,
    pub rebalance_count: usize,
}

impl TrialSummary {
    pub fn from_result(result: &BacktestResult) -> Self {
        let m = &result.metrics;
        Self {
            total_return_pct: m.total_return_pct,
            max_drawdown_pct: m.max_drawdown_pct,
            capital_efficiency: m.capital_efficiency,
            sharpe_ratio: m.sharpe_ratio,
            completed_cycles: m.completed_cycles,
            total_fills: m.total_fills,
            rebalance_count: result.rebalance_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub candidate: Candidate,
    pub key: CandidateKey,
    pub phase: SearchPhase,
    pub score: f64,
    /// 1-based position after ranking, 0 before
    pub rank: usize,
    pub summary: TrialSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    InvalidConfig(String),
    InsufficientData(String),
    SimulationFault(String),
    NonFiniteScore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialFailure {
    pub candidate: Candidate,
    pub key: CandidateKey,
    pub phase: SearchPhase,
    pub reason: FailureReason,
}

/// Order trials best first: score descending, candidate key ascending on ties,
/// then assign ranks 1..n.
pub fn rank_trials(trials: &mut [TrialResult]) {
    trials.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
    for (i, trial) in trials.iter_mut().enumerate() {
        trial.rank = i + 1;
    }
}

fn better(a: &TrialResult, b: &TrialResult) -> bool {
    b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)).is_lt()
}

/// Trials of one `evaluate_candidates` call
#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    /// Ranked best first
    pub ranked: Vec<TrialResult>,
    pub failures: Vec<TrialFailure>,
}

/// Everything needed to resume a search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationCheckpoint {
    pub id: String,
    pub symbol: String,
    pub cluster: Option<CoinCluster>,
    pub objective: Objective,
    pub search_space: SearchSpace,
    pub phase: SearchPhase,
    pub trials: Vec<TrialResult>,
    pub failures: Vec<TrialFailure>,
    pub best: Option<TrialResult>,
    pub batches_completed: usize,
}

impl OptimizationCheckpoint {
    pub fn evaluated_keys(&self) -> HashSet<CandidateKey> {
        self.trials
            .iter()
            .map(|t| t.key)
            .chain(self.failures.iter().map(|f| f.key))
            .collect()
    }

    pub fn record(&mut self, outcome: PhaseOutcome) {
        for trial in outcome.ranked {
            let replaces_best = self.best.as_ref().map_or(true, |best| better(&trial, best));
            if replaces_best {
                self.best = Some(trial.clone());
            }
            self.trials.push(trial);
        }
        self.failures.extend(outcome.failures);
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.score)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub objective: Objective,
    /// Coarse results expanded in the fine phase
    pub top_k: usize,
    /// Fine neighbourhood size in steps along level count and width
    pub fine_radius: usize,
    /// Candidates per checkpointed batch
    pub batch_size: usize,
    pub parallel: bool,
    /// Share of capital spread over the levels when sizing orders
    pub capital_fraction: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            objective: Objective::default(),
            top_k: 3,
            fine_radius: 1,
            batch_size: 8,
            parallel: true,
            capital_fraction: 1.0,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> GridResult<()> {
        if self.batch_size == 0 {
            return Err(GridError::invalid_config("batch_size must be at least 1"));
        }
        if !(self.capital_fraction > 0.0 && self.capital_fraction <= 1.0) {
            return Err(GridError::invalid_config("capital_fraction must be in (0, 1]"));
        }
        if let Objective::DrawdownPenalized { penalty } = self.objective {
            if !penalty.is_finite() || penalty < 0.0 {
                return Err(GridError::invalid_config("drawdown penalty must be non-negative"));
            }
        }
        Ok(())
    }
}

/// Shared flag checked between batches
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    pub checkpoint: OptimizationCheckpoint,
    /// Full backtest of the best candidate, when the search completed
    pub best_result: Option<BacktestResult>,
}

impl OptimizationOutcome {
    pub fn is_cancelled(&self) -> bool {
        self.checkpoint.phase == SearchPhase::Cancelled
    }

    pub fn ranked(&self) -> &[TrialResult] {
        &self.checkpoint.trials
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::preset_for;

    fn trial(score: f64, level_count: usize) -> TrialResult {
        let candidate = Candidate::new(SpacingMode::Arithmetic, level_count, 0.2);
        TrialResult {
            candidate,
            key: candidate.key(),
            phase: SearchPhase::Coarse,
            score,
            rank: 0,
            summary: TrialSummary {
                total_return_pct: score,
                max_drawdown_pct: 0.0,
                capital_efficiency: 0.0,
                sharpe_ratio: 0.0,
                completed_cycles: 0,
                total_fills: 0,
                rebalance_count: 0,
            },
        }
    }

    #[test]
    fn test_ranking_breaks_ties_by_key() {
        let mut trials = vec![trial(1.0, 12), trial(3.0, 20), trial(1.0, 8)];
        rank_trials(&mut trials);
        let order: Vec<(usize, usize)> = trials.iter().map(|t| (t.candidate.level_count, t.rank)).collect();
        assert_eq!(order, vec![(20, 1), (8, 2), (12, 3)]);
    }

    #[test]
    fn test_coarse_candidates_are_cartesian() {
        let space = SearchSpace::from_preset(&preset_for(CoinCluster::MediumVolatility));
        let candidates = space.coarse_candidates();
        assert_eq!(candidates.len(), 2 * 3 * 3);
        let keys: HashSet<CandidateKey> = candidates.iter().map(|c| c.key()).collect();
        assert_eq!(keys.len(), candidates.len());
    }

    #[test]
    fn test_key_quantizes_width() {
        let a = Candidate::new(SpacingMode::Geometric, 10, 0.1 + 0.2);
        let b = Candidate::new(SpacingMode::Geometric, 10, 0.3);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_checkpoint_tracks_best() {
        let mut checkpoint = OptimizationCheckpoint {
            id: "test".to_string(),
            symbol: "TEST/USDT".to_string(),
            cluster: None,
            objective: Objective::TotalReturn,
            search_space: SearchSpace::from_preset(&preset_for(CoinCluster::LowVolatility)),
            phase: SearchPhase::Coarse,
            trials: Vec::new(),
            failures: Vec::new(),
            best: None,
            batches_completed: 0,
        };
        checkpoint.record(PhaseOutcome {
            ranked: vec![trial(2.0, 10), trial(5.0, 20)],
            failures: Vec::new(),
        });
        checkpoint.record(PhaseOutcome {
            ranked: vec![trial(4.0, 30)],
            failures: Vec::new(),
        });
        assert_eq!(checkpoint.best_score(), Some(5.0));
        assert_eq!(checkpoint.evaluated_keys().len(), 3);
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
