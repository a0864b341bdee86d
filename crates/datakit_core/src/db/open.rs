//! Connection bootstrap utilities for SQLite stores.
//!
//! # Invariants
//! - Returned connections have layout migrations fully applied.
//! - File stores run in WAL journal mode.

use super::migrations::apply_migrations;
use super::{StoreError, StoreResult};
use log::{error, info};
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Clone, Copy)]
enum OpenMode<'a> {
    File(&'a Path),
    Memory,
}

impl OpenMode<'_> {
    fn label(self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Memory => "memory",
        }
    }
}

/// Opens (or creates) a store file and applies pending layout migrations.
///
/// # Side effects
/// - Creates the file when missing.
/// - Emits `store_open` logging events with duration and status.
pub fn open_store_file(path: impl AsRef<Path>) -> StoreResult<Connection> {
    open_connection(OpenMode::File(path.as_ref()))
}

/// Opens a fresh, empty in-memory store.
pub fn open_store_in_memory() -> StoreResult<Connection> {
    open_connection(OpenMode::Memory)
}

fn open_connection(mode: OpenMode<'_>) -> StoreResult<Connection> {
    let started_at = Instant::now();
    info!(
        "event=store_open module=db status=start mode={}",
        mode.label()
    );

    let opened = match mode {
        OpenMode::File(path) => Connection::open(path),
        OpenMode::Memory => Connection::open_in_memory(),
    };
    let result = opened
        .map_err(StoreError::from)
        .and_then(|mut conn| bootstrap_connection(&mut conn, mode).map(|()| conn));

    match &result {
        Ok(_) => info!(
            "event=store_open module=db status=ok mode={} duration_ms={}",
            mode.label(),
            started_at.elapsed().as_millis()
        ),
        Err(err) => error!(
            "event=store_open module=db status=error mode={} duration_ms={} error={}",
            mode.label(),
            started_at.elapsed().as_millis(),
            err
        ),
    }
    result
}

fn bootstrap_connection(conn: &mut Connection, mode: OpenMode<'_>) -> StoreResult<()> {
    if let OpenMode::File(_) = mode {
        // journal_mode returns a row, so it cannot go through execute_batch.
        conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;
    }
    conn.busy_timeout(Duration::from_secs(5))?;
    apply_migrations(conn)?;
    Ok(())
}
