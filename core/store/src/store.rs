//! Connection management for the local store.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

use driftwood_common::{Error, Result};

use crate::schema;

/// Persistent, transactional local store backed by SQLite.
///
/// The connection sits behind a mutex: local operations are short and
/// synchronous, so UI writers and the background sync run can share one
/// store without ever waiting on network I/O.
pub struct LocalStore {
    conn: Mutex<Connection>,
    location: String,
}

impl LocalStore {
    /// Create or open a local store database.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the file cannot be opened, is not a
    ///   database, is corrupted or is not writable
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path).map_err(unavailable)?;
        Self::init(conn, db_path.display().to_string())
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::init(conn, ":memory:".to_string())
    }

    fn init(conn: Connection, location: String) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(unavailable)?;
        // journal_mode answers with a row, so it has to go through query_row.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(unavailable)?;
        schema::migrate(&conn).map_err(unavailable)?;

        info!("Local store opened at {}", location);
        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    /// Where the store lives (file path or `:memory:`).
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Drop all data and recreate an empty schema.
    ///
    /// This is the recovery path after `StorageUnavailable`; everything not
    /// yet pushed to the remote store is lost.
    pub fn reset(&self) -> Result<()> {
        warn!("Resetting local store at {}", self.location);
        let conn = self.conn()?;
        schema::recreate(&conn).map_err(storage_err)
    }

    /// Lock the connection.
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StorageUnavailable("local store lock poisoned".to_string()))
    }
}

/// Map a SQLite failure onto the storage error taxonomy.
pub(crate) fn storage_err(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseCorrupt
            | ErrorCode::NotADatabase
            | ErrorCode::CannotOpen
            | ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull => Error::StorageUnavailable(err.to_string()),
            _ => Error::Storage(err.to_string()),
        },
        _ => Error::Storage(err.to_string()),
    }
}

/// Any failure while opening is fatal for the store.
fn unavailable(err: rusqlite::Error) -> Error {
    Error::StorageUnavailable(err.to_string())
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Storage(format!("Invalid stored timestamp: {}", micros)))
}
