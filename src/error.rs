//! Unified error handling for the grid backtesting engine
//!
//! Four outcomes matter to callers: a rejected configuration, a rejected coin
//! profile, a simulation that broke one of its own invariants, and failures of
//! the collaborators around the core (storage, files, parsing). Optimizer trial
//! failures are recorded values (`optimization::TrialFailure`), not errors.

use std::fmt;
use std::io;

use crate::core::order_manager::SimulationFault;

/// Main error type for the engine
#[derive(Debug)]
pub enum GridError {
    /// Bad grid, backtest or optimizer configuration, rejected before any simulation starts
    InvalidConfig(String),
    /// Bad clusterizer input
    InvalidProfile(String),
    /// No usable candles for the requested run
    InsufficientData(String),
    /// Internal invariant violated mid-run; carries the manager state at the time
    SimulationFault(Box<SimulationFault>),

    // Collaborator errors
    Persistence(String),
    Io(String),
    Parse(String),
}

impl GridError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        GridError::InvalidConfig(msg.into())
    }

    pub fn invalid_profile(msg: impl Into<String>) -> Self {
        GridError::InvalidProfile(msg.into())
    }

    /// Get a user-friendly error message with helpful context
    pub fn user_message(&self) -> String {
        match self {
            GridError::InvalidConfig(msg) => {
                format!(
                    "Invalid configuration: {}\n\n\
                    💡 Check that:\n\
                    - upper_price is above lower_price\n\
                    - level_count is at least 2\n\
                    - order_size and capital are positive",
                    msg
                )
            }
            GridError::SimulationFault(fault) => {
                format!(
                    "Simulation fault: {}\n\n\
                    This is a bug in the engine. State at failure:\n{}",
                    fault.reason,
                    fault.snapshot.summary()
                )
            }
            GridError::InsufficientData(msg) => {
                format!(
                    "Insufficient data: {}\n\n\
                    💡 Make sure the candle file is not empty and the time range overlaps it",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }

    /// Only a simulation fault signals a bug; everything else is an expected outcome
    pub fn is_bug(&self) -> bool {
        matches!(self, GridError::SimulationFault(_))
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            GridError::InvalidConfig(_) => "config",
            GridError::InvalidProfile(_) => "profile",
            GridError::InsufficientData(_) => "data",
            GridError::SimulationFault(_) => "simulation",
            GridError::Persistence(_) => "persistence",
            GridError::Io(_) | GridError::Parse(_) => "io",
        }
    }
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            GridError::InvalidProfile(msg) => write!(f, "Invalid coin profile: {}", msg),
            GridError::InsufficientData(msg) => write!(f, "Insufficient data: {}", msg),
            GridError::SimulationFault(fault) => write!(f, "Simulation fault: {}", fault.reason),
            GridError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            GridError::Io(msg) => write!(f, "IO error: {}", msg),
            GridError::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for GridError {}

impl From<SimulationFault> for GridError {
    fn from(fault: SimulationFault) -> Self {
        GridError::SimulationFault(Box::new(fault))
    }
}

impl From<io::Error> for GridError {
    fn from(err: io::Error) -> Self {
        GridError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::Parse(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for GridError {
    fn from(err: toml::de::Error) -> Self {
        GridError::Parse(format!("TOML parse error: {}", err))
    }
}

impl From<rusqlite::Error> for GridError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                GridError::Persistence("Query returned no rows".to_string())
            }
            _ => GridError::Persistence(err.to_string()),
        }
    }
}

impl From<crate::config::ConfigError> for GridError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::FileRead(msg) | ConfigError::FileWrite(msg) => GridError::Io(msg),
            ConfigError::Parse(msg) | ConfigError::Serialize(msg) => GridError::Parse(msg),
            ConfigError::Validation(msg) => GridError::InvalidConfig(msg),
        }
    }
}

/// Result type alias using GridError
pub type GridResult<T> = Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GridError::invalid_config("upper_price must exceed lower_price");
        assert!(err.to_string().contains("upper_price"));
    }

    #[test]
    fn test_error_category() {
        assert_eq!(GridError::invalid_config("x").category(), "config");
        assert_eq!(GridError::invalid_profile("x").category(), "profile");
        assert_eq!(GridError::Persistence("x".to_string()).category(), "persistence");
    }

    #[test]
    fn test_only_simulation_fault_is_bug() {
        assert!(!GridError::invalid_config("x").is_bug());
        assert!(!GridError::invalid_profile("x").is_bug());
        assert!(!GridError::Io("x".to_string()).is_bug());
    }

    #[test]
    fn test_user_message() {
        let msg = GridError::invalid_config("level_count must be at least 2").user_message();
        assert!(msg.contains("level_count"));
        assert!(msg.contains("💡"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "candles.json");
        let err: GridError = io_err.into();
        assert!(matches!(err, GridError::Io(_)));
    }
}
