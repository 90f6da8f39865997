// Common test utilities and helpers
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use grid_optimizer::Candle;
use tempfile::TempDir;
use std::path::PathBuf;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Hourly candles from (open, high, low, close) rows
pub fn candles_from_rows(rows: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
    rows.iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| Candle::new(start_time() + Duration::hours(i as i64), o, h, l, c, 1_000.0))
        .collect()
}

/// Sine wave around `base` with the given amplitude; starts exactly at `base`
pub fn oscillating_candles(base: f64, amplitude: f64, count: usize) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let open = base + amplitude * (i as f64 / 6.0).sin();
            let close = base + amplitude * ((i + 1) as f64 / 6.0).sin();
            Candle::new(
                start_time() + Duration::hours(i as i64),
                open,
                open.max(close) + amplitude * 0.1,
                open.min(close) - amplitude * 0.1,
                close,
                1_000.0,
            )
        })
        .collect()
}

/// Create a temporary directory for test databases
pub fn create_temp_db_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");
    (temp_dir, db_path)
}
