// Grid Optimizer Library
//
// Candle-driven grid trading simulation with volatility clustering and a
// checkpointed two-phase parameter search

pub mod backtesting;
pub mod clustering;
pub mod config;
pub mod core;
pub mod db;          // SQLite checkpoint and result store
pub mod error;       // Unified error handling
pub mod optimization;
pub mod progress;
pub mod store;

// Re-export core grid types
pub use self::core::{Candle, GridConfig, GridLevel, GridOrderManager, OrderSide, PriceBounds, SpacingMode};

// Re-export error types
pub use error::{GridError, GridResult};

// Re-export configuration
pub use config::{AppConfig, ConfigError};

// Re-export database types
pub use db::Database;
pub use store::{MemoryStore, ResultStore};

// Re-export backtesting components
pub use backtesting::{
    BacktestConfig, BacktestResult, PerformanceMetrics,
    analytics::PerformanceAnalyzer,
    engine::{BacktestBuilder, BacktestEngine},
};

// Re-export clustering and optimization components
pub use clustering::{classify, preset_for, CoinCluster, CoinProfile};
pub use optimization::{
    CancellationToken, Objective, OptimizationCheckpoint, OptimizationOutcome, Optimizer, OptimizerConfig,
    SearchSpace,
};
