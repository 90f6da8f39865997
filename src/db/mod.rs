//! Database module for SQLite-backed checkpoints and backtest results

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub mod checkpoint;
pub mod result;

pub use checkpoint::CheckpointRecord;
pub use result::StoredResult;

use crate::backtesting::BacktestResult;
use crate::error::{GridError, GridResult};
use crate::optimization::OptimizationCheckpoint;
use crate::store::ResultStore;

/// Database manager with a shared connection
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file and apply the schema
    pub fn new<P: AsRef<Path>>(path: P) -> GridResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> GridResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run migrations to set up or update the schema
    pub fn run_migrations(&self) -> GridResult<()> {
        let conn = lock(&self.conn)?;
        let migration_sql = include_str!("migrations/V1__initial_schema.sql");
        conn.execute_batch(migration_sql)?;
        Ok(())
    }

    /// Get a reference to the connection (for custom queries)
    pub fn get_connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Check database health
    pub fn health_check(&self) -> GridResult<bool> {
        let conn = lock(&self.conn)?;
        let result: i32 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
        Ok(result == 1)
    }

    pub fn list_checkpoints(&self, symbol: &str) -> GridResult<Vec<CheckpointRecord>> {
        CheckpointRecord::find_by_symbol(&self.conn, symbol)
    }

    pub fn list_results(&self, symbol: &str) -> GridResult<Vec<StoredResult>> {
        StoredResult::find_by_symbol(&self.conn, symbol)
    }
}

pub(crate) fn lock(conn: &Arc<Mutex<Connection>>) -> GridResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| GridError::Persistence("database connection lock poisoned".to_string()))
}

impl ResultStore for Database {
    fn save_checkpoint(&self, checkpoint: &OptimizationCheckpoint) -> GridResult<()> {
        CheckpointRecord::upsert(&self.conn, checkpoint)
    }

    fn load_checkpoint(&self, id: &str) -> GridResult<Option<OptimizationCheckpoint>> {
        CheckpointRecord::load(&self.conn, id)
    }

    fn save_result(&self, result: &BacktestResult) -> GridResult<()> {
        StoredResult::insert(&self.conn, result).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_creation() {
        let db = Database::new_in_memory().unwrap();
        assert!(db.health_check().unwrap());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::new_in_memory().unwrap();
        db.run_migrations().unwrap();

        let conn = db.conn.lock().unwrap();
        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE type='table'", [], |row| row.get(0))
            .unwrap();

        assert!(count >= 2); // optimization_checkpoints, backtest_results
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let db = Database::new_in_memory().unwrap();
        assert!(db.load_checkpoint("does-not-exist").unwrap().is_none());
    }
}
