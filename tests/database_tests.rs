// Integration tests for database operations

mod common;

use grid_optimizer::db::StoredResult;
use grid_optimizer::optimization::SearchPhase;
use grid_optimizer::{
    BacktestBuilder, BacktestConfig, CancellationToken, Database, GridConfig, Objective, Optimizer, OptimizerConfig,
    ResultStore, SearchSpace, SpacingMode,
};
use common::{create_temp_db_dir, oscillating_candles};

#[test]
fn test_database_creation() {
    let (_temp_dir, db_path) = create_temp_db_dir();

    let db = Database::new(&db_path);
    assert!(db.is_ok(), "Database creation should succeed");
    assert!(db.unwrap().health_check().unwrap());
}

#[test]
fn test_database_creates_parent_directory() {
    let (temp_dir, _) = create_temp_db_dir();
    let nested = temp_dir.path().join("nested").join("grid.db");
    Database::new(&nested).expect("Failed to create nested database");
    assert!(nested.exists());
}

#[test]
fn test_backtest_result_round_trip() {
    let (_temp_dir, db_path) = create_temp_db_dir();
    let db = Database::new(&db_path).expect("Failed to create database");

    let candles = oscillating_candles(100.0, 8.0, 48);
    let result = BacktestBuilder::new()
        .with_symbol("ETH/USDT")
        .with_grid(GridConfig::new(90.0, 110.0, 9, 0.5))
        .build()
        .run(&candles)
        .unwrap();

    let id = StoredResult::insert(&db.get_connection(), &result).unwrap();
    assert!(id > 0, "Result ID should be positive");

    let stored = db.list_results("ETH/USDT").unwrap();
    assert_eq!(stored.len(), 1);
    let loaded = &stored[0].result;
    assert_eq!(stored[0].id, id);
    assert_eq!(loaded.symbol, result.symbol);
    assert_eq!(loaded.grid_config.level_count, 9);
    assert_eq!(loaded.fills.len(), result.fills.len());
    assert_eq!(loaded.cycles.len(), result.cycles.len());
    assert_eq!(loaded, &result);

    // Floats come back bit-exact, so the stored fills replay the stored curve
    let recorded: Vec<f64> = loaded.equity_curve.iter().map(|p| p.equity).collect();
    assert_eq!(loaded.replay_equity(), recorded);

    assert!(db.list_results("BTC/USDT").unwrap().is_empty());
}

#[test]
fn test_optimizer_checkpoints_persist_across_connections() {
    let (_temp_dir, db_path) = create_temp_db_dir();
    let candles = oscillating_candles(100.0, 6.0, 48);
    let space = SearchSpace {
        spacing_modes: vec![SpacingMode::Arithmetic],
        level_counts: vec![6, 10],
        bound_widths: vec![0.12, 0.2],
        fine_level_step: 2,
        fine_width_step: 0.02,
    };
    let config = OptimizerConfig {
        objective: Objective::TotalReturn,
        top_k: 1,
        batch_size: 2,
        ..OptimizerConfig::default()
    };
    let expected_space = space.clone();
    let optimizer = Optimizer::new(BacktestConfig::default(), config, space, &candles).unwrap();

    let checkpoint_id = {
        let db = Database::new(&db_path).unwrap();
        let outcome = optimizer.optimize(&db, &CancellationToken::new()).unwrap();
        outcome.checkpoint.id
    };

    let db = Database::new(&db_path).unwrap();
    let checkpoint = db.load_checkpoint(&checkpoint_id).unwrap().expect("checkpoint should be stored");
    assert_eq!(checkpoint.phase, SearchPhase::Complete);
    assert!(checkpoint.best.is_some());

    let records = db.list_checkpoints("BTC/USDT").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, checkpoint_id);
    assert_eq!(records[0].phase, SearchPhase::Complete.label());
    assert_eq!(records[0].best_score, checkpoint.best_score());

    // The winner's full backtest is stored as well
    assert_eq!(db.list_results("BTC/USDT").unwrap().len(), 1);

    // A reloaded checkpoint still matches the unchanged search space
    let resumed = optimizer.resume(&checkpoint_id, &db, &CancellationToken::new()).unwrap();
    assert_eq!(resumed.checkpoint.search_space, expected_space);
    assert_eq!(resumed.checkpoint.best_score(), checkpoint.best_score());
}

#[test]
fn test_saving_checkpoint_twice_updates_row() {
    let db = Database::new_in_memory().unwrap();
    let candles = oscillating_candles(100.0, 6.0, 24);
    let space = SearchSpace {
        spacing_modes: vec![SpacingMode::Geometric],
        level_counts: vec![6],
        bound_widths: vec![0.2],
        fine_level_step: 1,
        fine_width_step: 0.0,
    };
    let optimizer = Optimizer::new(BacktestConfig::default(), OptimizerConfig::default(), space, &candles).unwrap();

    let mut checkpoint = optimizer.new_checkpoint();
    db.save_checkpoint(&checkpoint).unwrap();
    checkpoint.batches_completed = 5;
    checkpoint.phase = SearchPhase::Fine;
    db.save_checkpoint(&checkpoint).unwrap();

    let records = db.list_checkpoints("BTC/USDT").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].batches_completed, 5);
    assert_eq!(db.load_checkpoint(&checkpoint.id).unwrap(), Some(checkpoint));
}
