//! Connection bootstrap.
//!
//! Returned connections have `foreign_keys=ON` and every migration applied.

use std::path::Path;
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::error::DbResult;
use crate::migrations::apply_migrations;

pub fn open_db(path: impl AsRef<Path>) -> DbResult<Connection> {
    let path = path.as_ref();
    let started = Instant::now();
    let mut conn = Connection::open(path)?;
    bootstrap(&mut conn)?;
    tracing::info!(
        path = %path.display(),
        duration_ms = started.elapsed().as_millis() as u64,
        "database opened",
    );
    Ok(conn)
}

pub fn open_db_in_memory() -> DbResult<Connection> {
    let mut conn = Connection::open_in_memory()?;
    bootstrap(&mut conn)?;
    tracing::debug!("in-memory database opened");
    Ok(conn)
}

fn bootstrap(conn: &mut Connection) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    apply_migrations(conn)
}
