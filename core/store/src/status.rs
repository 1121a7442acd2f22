//! Persisted sync bookkeeping (key/value).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use driftwood_common::Result;

use crate::store::{storage_err, LocalStore};

const LAST_SYNC_AT: &str = "last_sync_at";
const LAST_ERROR: &str = "last_error";
const LAST_STATE: &str = "last_state";

/// What the orchestrator remembers between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusRecord {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_state: Option<String>,
}

impl LocalStore {
    /// Get a status value.
    pub fn get_status_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM sync_status WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)
    }

    /// Set a status value.
    pub fn set_status_value(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_status (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Clear a status value.
    pub fn clear_status_value(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sync_status WHERE key = ?1", params![key])
            .map_err(storage_err)?;
        Ok(())
    }

    /// Load the persisted status record.
    pub fn load_status(&self) -> Result<SyncStatusRecord> {
        let last_sync_at = self
            .get_status_value(LAST_SYNC_AT)?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(SyncStatusRecord {
            last_sync_at,
            last_error: self.get_status_value(LAST_ERROR)?,
            last_state: self.get_status_value(LAST_STATE)?,
        })
    }

    /// Persist the status record.
    pub fn save_status(&self, status: &SyncStatusRecord) -> Result<()> {
        match status.last_sync_at {
            Some(at) => self.set_status_value(LAST_SYNC_AT, &at.to_rfc3339())?,
            None => self.clear_status_value(LAST_SYNC_AT)?,
        }
        match &status.last_error {
            Some(err) => self.set_status_value(LAST_ERROR, err)?,
            None => self.clear_status_value(LAST_ERROR)?,
        }
        match &status.last_state {
            Some(state) => self.set_status_value(LAST_STATE, state)?,
            None => self.clear_status_value(LAST_STATE)?,
        }
        Ok(())
    }
}
