// Integration tests for configuration loading and validation

mod common;

use grid_optimizer::{AppConfig, BacktestEngine, ConfigError, Objective, SpacingMode};
use common::candles_from_rows;
use std::fs;
use tempfile::TempDir;

const SAMPLE_CONFIG: &str = r#"
[backtest]
symbol = "SOL/USDT"
initial_capital = 5000.0

[backtest.fees]
maker_fee_rate = 0.0
fixed_fee_per_fill = 0.0

[grid]
spacing = "Arithmetic"
lower_price = 90.0
upper_price = 110.0
level_count = 5
order_size = 2.0

[optimization]
top_k = 5
batch_size = 4

[optimization.objective]
kind = "drawdown_penalized"
penalty = 1.5

[clustering]
atr_period = 20

[logging]
level = "debug"
"#;

#[test]
fn test_config_file_loading() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, SAMPLE_CONFIG).expect("Failed to write config file");

    let config = AppConfig::from_file(&config_path).expect("Failed to load config");
    assert_eq!(config.backtest.symbol, "SOL/USDT");
    assert_eq!(config.grid.spacing, SpacingMode::Arithmetic);
    assert_eq!(config.optimization.top_k, 5);
    assert_eq!(config.optimization.objective, Objective::DrawdownPenalized { penalty: 1.5 });
    assert_eq!(config.clustering.atr_period, 20);
    // Unspecified sections keep their defaults
    assert_eq!(config.optimization.fine_radius, 1);
    assert_eq!(config.database.path, "data/grid_optimizer.db");
}

#[test]
fn test_loaded_config_drives_a_backtest() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, SAMPLE_CONFIG).unwrap();
    let config = AppConfig::from_file(&config_path).unwrap();

    let candles = candles_from_rows(&[(100.0, 104.0, 95.0, 104.0), (104.0, 106.0, 104.0, 106.0)]);
    let result = BacktestEngine::new(config.backtest_config()).run(&candles).unwrap();

    // Fee-free cycle of two units across one 5.0 step
    assert_eq!(result.symbol, "SOL/USDT");
    assert_eq!(result.cycles.len(), 1);
    assert!((result.cycles[0].realized_pnl - 10.0).abs() < 1e-9);
}

#[test]
fn test_invalid_values_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, SAMPLE_CONFIG.replace("level_count = 5", "level_count = 1")).unwrap();

    let err = AppConfig::from_file(&config_path).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_malformed_file_is_a_parse_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "[grid\nlower_price = ").unwrap();

    assert!(matches!(AppConfig::from_file(&config_path), Err(ConfigError::Parse(_))));
    assert!(matches!(
        AppConfig::from_file(temp_dir.path().join("missing.toml")),
        Err(ConfigError::FileRead(_))
    ));
}

#[test]
fn test_saved_config_loads_back() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");

    let mut config = AppConfig::default();
    config.grid = config.grid.with_spacing(SpacingMode::Geometric).with_take_profit(250.0);
    config.optimization.objective = Objective::TotalReturn;
    config.to_file(&config_path).unwrap();

    assert_eq!(AppConfig::from_file(&config_path).unwrap(), config);
}
