//! Backtest result persistence

use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

use super::lock;
use crate::backtesting::BacktestResult;
use crate::error::GridResult;

#[derive(Debug, Clone)]
pub struct StoredResult {
    pub id: i64,
    pub created_at: String,
    pub result: BacktestResult,
}

impl StoredResult {
    /// Insert a result and return its row id
    pub fn insert(conn: &Arc<Mutex<Connection>>, result: &BacktestResult) -> GridResult<i64> {
        let payload = serde_json::to_string(result)?;
        let conn = lock(conn)?;
        conn.execute(
            "INSERT INTO backtest_results
                (symbol, lower_price, upper_price, level_count, total_return_pct,
                 max_drawdown_pct, completed_cycles, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                result.symbol,
                result.grid_config.lower_price,
                result.grid_config.upper_price,
                result.grid_config.level_count as i64,
                result.metrics.total_return_pct,
                result.metrics.max_drawdown_pct,
                result.metrics.completed_cycles as i64,
                payload,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Results for a symbol, oldest first
    pub fn find_by_symbol(conn: &Arc<Mutex<Connection>>, symbol: &str) -> GridResult<Vec<Self>> {
        let conn = lock(conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, payload FROM backtest_results WHERE symbol = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![symbol], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (id, created_at, payload) = row?;
            results.push(StoredResult {
                id,
                created_at,
                result: serde_json::from_str(&payload)?,
            });
        }
        Ok(results)
    }
}
