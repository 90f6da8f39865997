// Coarse-to-fine grid parameter search with checkpointing

use std::collections::HashSet;

use rayon::prelude::*;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backtesting::engine::BacktestEngine;
use crate::backtesting::{BacktestConfig, BacktestResult};
use crate::clustering::{classify, preset_for, ClusterThresholds, CoinCluster, CoinProfile};
use crate::core::grid_calculator::round_half_up;
use crate::core::types::{Candle, GridConfig};
use crate::error::{GridError, GridResult};
use crate::optimization::{
    quantize_width, rank_trials, CancellationToken, Candidate, CandidateKey, FailureReason,
    OptimizationCheckpoint, OptimizationOutcome, OptimizerConfig, PhaseOutcome, Scorer, SearchPhase,
    SearchSpace, TrialFailure, TrialResult, TrialSummary,
};
use crate::progress::OptimizationProgress;
use crate::store::ResultStore;

pub struct Optimizer<'a> {
    base: BacktestConfig,
    config: OptimizerConfig,
    space: SearchSpace,
    candles: &'a [Candle],
    anchor_price: f64,
    cluster: Option<CoinCluster>,
    show_progress: bool,
}

impl<'a> Optimizer<'a> {
    /// Candidates are centred on the open of the first usable candle in the
    /// configured time range.
    pub fn new(
        base: BacktestConfig,
        config: OptimizerConfig,
        space: SearchSpace,
        candles: &'a [Candle],
    ) -> GridResult<Self> {
        base.validate()?;
        config.validate()?;
        space.validate()?;

        let anchor_price = candles
            .iter()
            .filter(|c| base.time_range.map_or(true, |r| r.contains(c.timestamp)))
            .find(|c| c.is_well_formed())
            .map(|c| c.open)
            .ok_or_else(|| {
                GridError::InsufficientData(format!("no usable candles to optimize {}", base.symbol))
            })?;

        Ok(Self {
            base,
            config,
            space,
            candles,
            anchor_price,
            cluster: None,
            show_progress: false,
        })
    }

    /// Classify the instrument and search inside its cluster preset
    pub fn for_profile(
        base: BacktestConfig,
        config: OptimizerConfig,
        profile: &CoinProfile,
        thresholds: Option<&ClusterThresholds>,
        candles: &'a [Candle],
    ) -> GridResult<Self> {
        let cluster = classify(profile, thresholds)?;
        let preset = preset_for(cluster);
        info!("🧭 {} classified as {} ({})", profile.symbol, cluster, preset.label);

        Ok(Self::new(base, config, SearchSpace::from_preset(&preset), candles)?.with_cluster(cluster))
    }

    pub fn with_cluster(mut self, cluster: CoinCluster) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }

    pub fn anchor_price(&self) -> f64 {
        self.anchor_price
    }

    pub fn search_space(&self) -> &SearchSpace {
        &self.space
    }

    /// Grid for a candidate: `width` split evenly around the anchor price,
    /// `capital_fraction` of capital spread evenly over the levels.
    pub fn grid_config_for(&self, candidate: &Candidate) -> GridConfig {
        let base = &self.base.grid;
        let half = candidate.bound_width / 2.0;
        let precision = base.price_precision;
        let budget = self.base.initial_capital * self.config.capital_fraction;

        GridConfig {
            spacing: candidate.spacing,
            lower_price: round_half_up(self.anchor_price * (1.0 - half), precision),
            upper_price: round_half_up(self.anchor_price * (1.0 + half), precision),
            level_count: candidate.level_count,
            order_size: budget / (candidate.level_count.max(1) as f64 * self.anchor_price),
            price_precision: precision,
            atr_adjustment: None,
            take_profit: base.take_profit,
            rebalance_on_exit: base.rebalance_on_exit,
        }
    }

    pub fn run_candidate(&self, candidate: &Candidate) -> GridResult<BacktestResult> {
        let mut config = self.base.clone();
        config.grid = self.grid_config_for(candidate);
        BacktestEngine::new(config).run(self.candles)
    }

    /// Backtest and score one candidate. Errors become a recorded failure.
    pub fn evaluate(&self, phase: SearchPhase, candidate: &Candidate) -> Result<TrialResult, TrialFailure> {
        let failure = |reason: FailureReason| TrialFailure {
            candidate: *candidate,
            key: candidate.key(),
            phase,
            reason,
        };

        let result = match self.run_candidate(candidate) {
            Ok(result) => result,
            Err(GridError::InvalidConfig(msg)) | Err(GridError::InvalidProfile(msg)) => {
                debug!("Candidate {} rejected: {}", candidate.label(), msg);
                return Err(failure(FailureReason::InvalidConfig(msg)));
            }
            Err(GridError::InsufficientData(msg)) => {
                return Err(failure(FailureReason::InsufficientData(msg)));
            }
            Err(GridError::SimulationFault(fault)) => {
                error!(
                    "🐛 Simulation fault for {}: {}\n{}",
                    candidate.label(),
                    fault.reason,
                    fault.snapshot.summary()
                );
                return Err(failure(FailureReason::SimulationFault(fault.reason)));
            }
            // The engine does no I/O; anything else is unexpected
            Err(other) => {
                error!("Unexpected error for {}: {}", candidate.label(), other);
                return Err(failure(FailureReason::SimulationFault(other.to_string())));
            }
        };

        let score = self.config.objective.score(&result);
        if !score.is_finite() {
            warn!("Candidate {} produced a non-finite score", candidate.label());
            return Err(failure(FailureReason::NonFiniteScore));
        }

        Ok(TrialResult {
            candidate: *candidate,
            key: candidate.key(),
            phase,
            score,
            rank: 0,
            summary: TrialSummary::from_result(&result),
        })
    }

    /// Evaluate candidates (in parallel when configured). Never fails as a
    /// whole; outcomes are merged in candidate order before ranking.
    pub fn evaluate_candidates(&self, phase: SearchPhase, candidates: &[Candidate]) -> PhaseOutcome {
        let outcomes: Vec<Result<TrialResult, TrialFailure>> = if self.config.parallel {
            candidates.par_iter().map(|c| self.evaluate(phase, c)).collect()
        } else {
            candidates.iter().map(|c| self.evaluate(phase, c)).collect()
        };

        let mut outcome = PhaseOutcome::default();
        for result in outcomes {
            match result {
                Ok(trial) => outcome.ranked.push(trial),
                Err(failure) => outcome.failures.push(failure),
            }
        }
        rank_trials(&mut outcome.ranked);
        outcome
    }

    /// Neighbours of the top coarse trials that have not been evaluated yet
    pub fn fine_candidates(&self, checkpoint: &OptimizationCheckpoint) -> Vec<Candidate> {
        let mut coarse: Vec<TrialResult> = checkpoint
            .trials
            .iter()
            .filter(|t| t.phase == SearchPhase::Coarse)
            .cloned()
            .collect();
        rank_trials(&mut coarse);

        let mut seen: HashSet<CandidateKey> = checkpoint.evaluated_keys();
        let radius = self.config.fine_radius as i64;
        let level_step = self.space.fine_level_step as i64;
        let width_step = self.space.fine_width_step;

        let mut candidates = Vec::new();
        for trial in coarse.iter().take(self.config.top_k) {
            let origin = trial.candidate;
            for dn in -radius..=radius {
                for dw in -radius..=radius {
                    if dn == 0 && dw == 0 {
                        continue;
                    }
                    let level_count = origin.level_count as i64 + dn * level_step;
                    let width = quantize_width(origin.bound_width + dw as f64 * width_step);
                    if level_count < 2 || !(width > 0.0 && width < 2.0) {
                        continue;
                    }
                    let candidate = Candidate::new(origin.spacing, level_count as usize, width);
                    if seen.insert(candidate.key()) {
                        candidates.push(candidate);
                    }
                }
            }
        }
        candidates
    }

    pub fn new_checkpoint(&self) -> OptimizationCheckpoint {
        OptimizationCheckpoint {
            id: Uuid::new_v4().to_string(),
            symbol: self.base.symbol.clone(),
            cluster: self.cluster,
            objective: self.config.objective,
            search_space: self.space.clone(),
            phase: SearchPhase::Coarse,
            trials: Vec::new(),
            failures: Vec::new(),
            best: None,
            batches_completed: 0,
        }
    }

    /// Run the full coarse-then-fine search under a fresh checkpoint id
    pub fn optimize(&self, store: &dyn ResultStore, cancel: &CancellationToken) -> GridResult<OptimizationOutcome> {
        let checkpoint = self.new_checkpoint();
        info!(
            "🔧 Optimizing {} around {:.4}: {} coarse candidates (checkpoint {})",
            self.base.symbol,
            self.anchor_price,
            self.space.coarse_candidates().len(),
            checkpoint.id
        );
        store.save_checkpoint(&checkpoint)?;
        self.run_search(checkpoint, store, cancel)
    }

    /// Continue a stored search, skipping every candidate it already evaluated
    pub fn resume(
        &self,
        checkpoint_id: &str,
        store: &dyn ResultStore,
        cancel: &CancellationToken,
    ) -> GridResult<OptimizationOutcome> {
        let mut checkpoint = store.load_checkpoint(checkpoint_id)?.ok_or_else(|| {
            GridError::invalid_config(format!("no optimization checkpoint with id {}", checkpoint_id))
        })?;

        if checkpoint.symbol != self.base.symbol
            || checkpoint.objective != self.config.objective
            || checkpoint.search_space != self.space
        {
            return Err(GridError::invalid_config(format!(
                "checkpoint {} was created for a different symbol, objective or search space",
                checkpoint_id
            )));
        }
        if checkpoint.phase == SearchPhase::Cancelled {
            checkpoint.phase = SearchPhase::Coarse;
        }

        info!(
            "🔁 Resuming {} at {} phase: {} trials and {} failures already done",
            checkpoint_id,
            checkpoint.phase.label(),
            checkpoint.trials.len(),
            checkpoint.failures.len()
        );
        self.run_search(checkpoint, store, cancel)
    }

    fn run_search(
        &self,
        mut checkpoint: OptimizationCheckpoint,
        store: &dyn ResultStore,
        cancel: &CancellationToken,
    ) -> GridResult<OptimizationOutcome> {
        let coarse = self.space.coarse_candidates();
        let mut progress = OptimizationProgress::new(coarse.len(), self.show_progress);

        if checkpoint.phase == SearchPhase::Coarse {
            if !self.run_phase(SearchPhase::Coarse, coarse, &mut checkpoint, store, cancel, &progress)? {
                return self.stop_cancelled(checkpoint, store, &progress);
            }
            checkpoint.phase = SearchPhase::Fine;
            store.save_checkpoint(&checkpoint)?;
        }

        if checkpoint.phase == SearchPhase::Fine {
            let fine = self.fine_candidates(&checkpoint);
            debug!("Fine phase: {} new candidates", fine.len());
            progress.extend(fine.len());
            if !self.run_phase(SearchPhase::Fine, fine, &mut checkpoint, store, cancel, &progress)? {
                return self.stop_cancelled(checkpoint, store, &progress);
            }
            checkpoint.phase = SearchPhase::Complete;
        }

        rank_trials(&mut checkpoint.trials);
        store.save_checkpoint(&checkpoint)?;

        let best_result = match &checkpoint.best {
            Some(best) => {
                let result = self.run_candidate(&best.candidate)?;
                store.save_result(&result)?;
                Some(result)
            }
            None => None,
        };

        progress.finish(checkpoint.best_score());
        match &checkpoint.best {
            Some(best) => info!(
                "✅ Optimization {} complete: best {} scored {:.4} ({} trials, {} failures)",
                checkpoint.id,
                best.candidate.label(),
                best.score,
                checkpoint.trials.len(),
                checkpoint.failures.len()
            ),
            None => warn!(
                "⚠️  Optimization {} complete without a successful trial ({} failures)",
                checkpoint.id,
                checkpoint.failures.len()
            ),
        }

        Ok(OptimizationOutcome {
            checkpoint,
            best_result,
        })
    }

    /// Evaluate the not-yet-done candidates batch by batch, checkpointing
    /// after each. Returns false when cancelled.
    fn run_phase(
        &self,
        phase: SearchPhase,
        candidates: Vec<Candidate>,
        checkpoint: &mut OptimizationCheckpoint,
        store: &dyn ResultStore,
        cancel: &CancellationToken,
        progress: &OptimizationProgress,
    ) -> GridResult<bool> {
        let done = checkpoint.evaluated_keys();
        let pending: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| !done.contains(&c.key()))
            .collect();

        for batch in pending.chunks(self.config.batch_size) {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let outcome = self.evaluate_candidates(phase, batch);
            debug!(
                "{} batch {}: {} ok, {} failed",
                phase.label(),
                checkpoint.batches_completed + 1,
                outcome.ranked.len(),
                outcome.failures.len()
            );
            checkpoint.record(outcome);
            checkpoint.batches_completed += 1;
            store.save_checkpoint(checkpoint)?;
            progress.update(
                checkpoint.trials.len() + checkpoint.failures.len(),
                checkpoint.best_score(),
                phase.label(),
            );
        }
        Ok(true)
    }

    fn stop_cancelled(
        &self,
        mut checkpoint: OptimizationCheckpoint,
        store: &dyn ResultStore,
        progress: &OptimizationProgress,
    ) -> GridResult<OptimizationOutcome> {
        checkpoint.phase = SearchPhase::Cancelled;
        store.save_checkpoint(&checkpoint)?;
        progress.abandon("cancelled");
        info!(
            "⏸️  Optimization {} cancelled after {} batches; resume with this id",
            checkpoint.id, checkpoint.batches_completed
        );
        Ok(OptimizationOutcome {
            checkpoint,
            best_result: None,
        })
    }
}
