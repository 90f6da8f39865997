//! Optimization checkpoint persistence

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

use super::lock;
use crate::error::GridResult;
use crate::optimization::OptimizationCheckpoint;

/// Summary row; the full checkpoint is the JSON payload
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub id: String,
    pub symbol: String,
    pub cluster: Option<String>,
    pub phase: String,
    pub batches_completed: i64,
    pub best_score: Option<f64>,
    pub updated_at: String,
}

impl CheckpointRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(CheckpointRecord {
            id: row.get(0)?,
            symbol: row.get(1)?,
            cluster: row.get(2)?,
            phase: row.get(3)?,
            batches_completed: row.get(4)?,
            best_score: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    /// Insert or replace the checkpoint with the same id
    pub fn upsert(conn: &Arc<Mutex<Connection>>, checkpoint: &OptimizationCheckpoint) -> GridResult<()> {
        let payload = serde_json::to_string(checkpoint)?;
        let conn = lock(conn)?;
        conn.execute(
            "INSERT INTO optimization_checkpoints
                (id, symbol, cluster, phase, batches_completed, best_score, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                phase = excluded.phase,
                batches_completed = excluded.batches_completed,
                best_score = excluded.best_score,
                payload = excluded.payload,
                updated_at = CURRENT_TIMESTAMP",
            params![
                checkpoint.id,
                checkpoint.symbol,
                checkpoint.cluster.map(|c| c.id()),
                checkpoint.phase.label(),
                checkpoint.batches_completed as i64,
                checkpoint.best_score(),
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn load(conn: &Arc<Mutex<Connection>>, id: &str) -> GridResult<Option<OptimizationCheckpoint>> {
        let conn = lock(conn)?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM optimization_checkpoints WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated first
    pub fn find_by_symbol(conn: &Arc<Mutex<Connection>>, symbol: &str) -> GridResult<Vec<Self>> {
        let conn = lock(conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, symbol, cluster, phase, batches_completed, best_score, updated_at
             FROM optimization_checkpoints
             WHERE symbol = ?1
             ORDER BY updated_at DESC, id",
        )?;
        let rows = stmt.query_map(params![symbol], Self::from_row)?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
