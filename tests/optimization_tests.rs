// Integration tests for clustering and the parameter optimizer

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use grid_optimizer::backtesting::BacktestResult;
use grid_optimizer::clustering::{classify, ClusterThresholds, CoinCluster, CoinProfile};
use grid_optimizer::optimization::{Candidate, FailureReason, SearchPhase};
use grid_optimizer::{
    BacktestConfig, CancellationToken, GridResult, MemoryStore, Objective, OptimizationCheckpoint, Optimizer,
    OptimizerConfig, ResultStore, SearchSpace, SpacingMode,
};
use common::oscillating_candles;

fn space() -> SearchSpace {
    SearchSpace {
        spacing_modes: vec![SpacingMode::Arithmetic, SpacingMode::Geometric],
        level_counts: vec![6, 10],
        bound_widths: vec![0.12, 0.2],
        fine_level_step: 2,
        fine_width_step: 0.02,
    }
}

fn optimizer_config() -> OptimizerConfig {
    OptimizerConfig {
        objective: Objective::TotalReturn,
        top_k: 2,
        batch_size: 2,
        ..OptimizerConfig::default()
    }
}

/// Cancels the shared token once a given number of checkpoints were saved
struct CancellingStore {
    inner: MemoryStore,
    cancel: CancellationToken,
    saves: AtomicUsize,
    cancel_after: usize,
}

impl ResultStore for CancellingStore {
    fn save_checkpoint(&self, checkpoint: &OptimizationCheckpoint) -> GridResult<()> {
        self.inner.save_checkpoint(checkpoint)?;
        if self.saves.fetch_add(1, Ordering::SeqCst) + 1 >= self.cancel_after {
            self.cancel.cancel();
        }
        Ok(())
    }

    fn load_checkpoint(&self, id: &str) -> GridResult<Option<OptimizationCheckpoint>> {
        self.inner.load_checkpoint(id)
    }

    fn save_result(&self, result: &BacktestResult) -> GridResult<()> {
        self.inner.save_result(result)
    }
}

#[test]
fn test_clusterizer_is_total() {
    let thresholds = ClusterThresholds::default();
    let atr_values = [0.0, 0.001, 0.015, 0.02, 0.04, 0.079, 0.08, 0.5, 10.0];
    let volumes = [0.0, 50.0, 100.0, 1e9];

    for &atr_pct in &atr_values {
        let mut previous: Option<CoinCluster> = None;
        for &avg_volume in volumes.iter().rev() {
            let profile = CoinProfile {
                symbol: "TEST/USDT".to_string(),
                atr_pct,
                avg_volume,
                typical_gap_pct: 0.001,
                samples: 100,
            };
            let cluster = classify(&profile, Some(&thresholds)).unwrap();
            assert!(CoinCluster::ALL.contains(&cluster));
            // Thinner volume never lowers the cluster
            if let Some(prev) = previous {
                assert!(cluster >= prev);
            }
            previous = Some(cluster);
        }
    }
}

#[test]
fn test_clusterizer_rejects_invalid_profiles() {
    let profile = CoinProfile {
        symbol: "BAD/USDT".to_string(),
        atr_pct: f64::NAN,
        avg_volume: 1_000.0,
        typical_gap_pct: 0.0,
        samples: 10,
    };
    assert!(classify(&profile, None).is_err());

    let empty = CoinProfile { samples: 0, atr_pct: 0.01, ..profile };
    assert!(classify(&empty, None).is_err());
}

#[test]
fn test_twelve_candidates_with_one_invalid() {
    let candles = oscillating_candles(100.0, 6.0, 48);
    let optimizer = Optimizer::new(BacktestConfig::default(), optimizer_config(), space(), &candles).unwrap();

    let mut candidates = Vec::new();
    for spacing in [SpacingMode::Arithmetic, SpacingMode::Geometric] {
        for level_count in [6, 8, 10] {
            for width in [0.12, 0.2] {
                candidates.push(Candidate::new(spacing, level_count, width));
            }
        }
    }
    assert_eq!(candidates.len(), 12);
    candidates[4].level_count = 1; // Fewer than two levels is not a grid

    let outcome = optimizer.evaluate_candidates(SearchPhase::Coarse, &candidates);
    assert_eq!(outcome.ranked.len(), 11);
    assert_eq!(outcome.failures.len(), 1);
    assert!(matches!(outcome.failures[0].reason, FailureReason::InvalidConfig(_)));

    let ranks: Vec<usize> = outcome.ranked.iter().map(|t| t.rank).collect();
    assert_eq!(ranks, (1..=11).collect::<Vec<_>>());
    assert!(outcome.ranked.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn test_full_search_stores_best_result() {
    let candles = oscillating_candles(100.0, 6.0, 48);
    let optimizer = Optimizer::new(BacktestConfig::default(), optimizer_config(), space(), &candles).unwrap();
    let store = MemoryStore::new();

    let outcome = optimizer.optimize(&store, &CancellationToken::new()).unwrap();
    assert_eq!(outcome.checkpoint.phase, SearchPhase::Complete);
    assert!(outcome.ranked().len() > 8, "fine phase adds neighbours");

    let best = outcome.checkpoint.best.as_ref().unwrap();
    assert_eq!(outcome.ranked()[0].score, best.score);
    let stored = store.results().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].grid_config.level_count, best.candidate.level_count);

    let saved = store.load_checkpoint(&outcome.checkpoint.id).unwrap().unwrap();
    assert_eq!(saved.phase, SearchPhase::Complete);
}

#[test]
fn test_cancelled_before_start() {
    let candles = oscillating_candles(100.0, 6.0, 48);
    let optimizer = Optimizer::new(BacktestConfig::default(), optimizer_config(), space(), &candles).unwrap();
    let store = MemoryStore::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = optimizer.optimize(&store, &cancel).unwrap();
    assert!(outcome.is_cancelled());
    assert!(outcome.ranked().is_empty());
    assert!(outcome.best_result.is_none());
    assert!(store.results().unwrap().is_empty());

    let saved = store.load_checkpoint(&outcome.checkpoint.id).unwrap().unwrap();
    assert_eq!(saved.phase, SearchPhase::Cancelled);
}

#[test]
fn test_token_cancelled_from_another_thread() {
    let candles = oscillating_candles(100.0, 6.0, 48);
    let optimizer = Optimizer::new(BacktestConfig::default(), optimizer_config(), space(), &candles).unwrap();
    let cancel = CancellationToken::new();

    // Same shape as a signal handler: a moved clone flips the shared flag
    let handler = cancel.clone();
    std::thread::spawn(move || handler.cancel()).join().unwrap();
    assert!(cancel.is_cancelled());

    let outcome = optimizer.optimize(&MemoryStore::new(), &cancel).unwrap();
    assert!(outcome.is_cancelled());
    assert_eq!(outcome.checkpoint.batches_completed, 0);
}

#[test]
fn test_resume_after_cancel_matches_uninterrupted_run() {
    let candles = oscillating_candles(100.0, 6.0, 48);
    let optimizer = Optimizer::new(BacktestConfig::default(), optimizer_config(), space(), &candles).unwrap();

    let reference = optimizer.optimize(&MemoryStore::new(), &CancellationToken::new()).unwrap();

    // Initial save plus two coarse batches, then stop
    let cancel = CancellationToken::new();
    let store = CancellingStore {
        inner: MemoryStore::new(),
        cancel: cancel.clone(),
        saves: AtomicUsize::new(0),
        cancel_after: 3,
    };
    let partial = optimizer.optimize(&store, &cancel).unwrap();
    assert!(partial.is_cancelled());
    assert_eq!(partial.checkpoint.batches_completed, 2);
    assert_eq!(partial.ranked().len() + partial.checkpoint.failures.len(), 4);

    let resumed = optimizer
        .resume(&partial.checkpoint.id, &store.inner, &CancellationToken::new())
        .unwrap();
    assert_eq!(resumed.checkpoint.id, partial.checkpoint.id);
    assert_eq!(resumed.checkpoint.phase, SearchPhase::Complete);

    let keys = |o: &grid_optimizer::OptimizationOutcome| {
        let mut keys: Vec<_> = o.ranked().iter().map(|t| t.key).collect();
        keys.sort();
        keys
    };
    assert_eq!(keys(&resumed), keys(&reference));
    assert_eq!(resumed.checkpoint.best_score(), reference.checkpoint.best_score());
}

#[test]
fn test_resume_rejects_unknown_checkpoint() {
    let candles = oscillating_candles(100.0, 6.0, 48);
    let optimizer = Optimizer::new(BacktestConfig::default(), optimizer_config(), space(), &candles).unwrap();
    let result = optimizer.resume("missing", &MemoryStore::new(), &CancellationToken::new());
    assert!(result.is_err());
}
