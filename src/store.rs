// Persistence seam for optimizer checkpoints and backtest results

use std::collections::HashMap;
use std::sync::Mutex;

use crate::backtesting::BacktestResult;
use crate::error::{GridError, GridResult};
use crate::optimization::OptimizationCheckpoint;

/// Where the optimizer keeps its progress. Saving a checkpoint with an
/// existing id replaces it.
pub trait ResultStore: Send + Sync {
    fn save_checkpoint(&self, checkpoint: &OptimizationCheckpoint) -> GridResult<()>;
    fn load_checkpoint(&self, id: &str) -> GridResult<Option<OptimizationCheckpoint>>;
    fn save_result(&self, result: &BacktestResult) -> GridResult<()>;
}

/// In-process store for tests and one-shot runs
#[derive(Default)]
pub struct MemoryStore {
    checkpoints: Mutex<HashMap<String, OptimizationCheckpoint>>,
    results: Mutex<Vec<BacktestResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> GridResult<Vec<BacktestResult>> {
        Ok(self.results.lock().map_err(|_| poisoned())?.clone())
    }
}

fn poisoned() -> GridError {
    GridError::Persistence("store lock poisoned".to_string())
}

impl ResultStore for MemoryStore {
    fn save_checkpoint(&self, checkpoint: &OptimizationCheckpoint) -> GridResult<()> {
        self.checkpoints
            .lock()
            .map_err(|_| poisoned())?
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    fn load_checkpoint(&self, id: &str) -> GridResult<Option<OptimizationCheckpoint>> {
        Ok(self.checkpoints.lock().map_err(|_| poisoned())?.get(id).cloned())
    }

    fn save_result(&self, result: &BacktestResult) -> GridResult<()> {
        self.results.lock().map_err(|_| poisoned())?.push(result.clone());
        Ok(())
    }
}
