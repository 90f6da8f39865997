// Core grid logic: level construction and the simulated order lifecycle

pub mod types;
pub mod grid_calculator;
pub mod order_manager;

// Re-export commonly used types
pub use types::{AtrAdjustment, Candle, GridConfig, GridLevel, LevelStatus, OrderSide, PriceBounds, SpacingMode};
pub use grid_calculator::{compute_levels, optimal_grid_count, recentred_bounds};
pub use order_manager::{GridOrder, GridOrderManager, ManagerSettings, ManagerSnapshot, SimulationFault};
