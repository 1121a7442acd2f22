//! Persisted conflicts.
//!
//! A conflict row exists while a local unsynced version and a newer,
//! different server version of the same record coexist. Rows survive
//! restarts and are keyed by `(collection, id)`, so there is never more than
//! one open conflict per record.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use driftwood_common::{
    now_micros, CollectionName, ConflictId, Error, Payload, Record, RecordId, Result,
};

use crate::queue::ack_all_for_record;
use crate::records::{load_record, upsert_record};
use crate::store::{from_micros, storage_err, to_micros, LocalStore};

/// An open conflict between a local and a server version of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: ConflictId,
    pub local_data: Payload,
    pub server_data: Payload,
    pub local_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    /// Top-level fields whose values differ.
    pub fields: Vec<String>,
}

impl Conflict {
    pub fn collection(&self) -> &CollectionName {
        &self.id.collection
    }

    pub fn record_id(&self) -> &RecordId {
        &self.id.record_id
    }
}

const CONFLICT_COLUMNS: &str =
    "collection, id, local_data, server_data, local_timestamp, server_timestamp, detected_at, fields";

struct ConflictRow {
    collection: String,
    id: String,
    local_data: String,
    server_data: String,
    local_timestamp: i64,
    server_timestamp: i64,
    detected_at: i64,
    fields: String,
}

impl ConflictRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            collection: row.get(0)?,
            id: row.get(1)?,
            local_data: row.get(2)?,
            server_data: row.get(3)?,
            local_timestamp: row.get(4)?,
            server_timestamp: row.get(5)?,
            detected_at: row.get(6)?,
            fields: row.get(7)?,
        })
    }

    fn into_conflict(self) -> Result<Conflict> {
        Ok(Conflict {
            id: ConflictId::new(
                CollectionName::new(self.collection)?,
                RecordId::new(self.id)?,
            ),
            local_data: serde_json::from_str(&self.local_data)?,
            server_data: serde_json::from_str(&self.server_data)?,
            local_timestamp: from_micros(self.local_timestamp)?,
            server_timestamp: from_micros(self.server_timestamp)?,
            detected_at: from_micros(self.detected_at)?,
            fields: serde_json::from_str(&self.fields)?,
        })
    }
}

pub(crate) fn conflict_exists(
    conn: &Connection,
    collection: &CollectionName,
    id: &RecordId,
) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM conflicts WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    Ok(found.is_some())
}

impl LocalStore {
    /// Persist a conflict, replacing any open conflict for the same record.
    pub fn open_conflict(&self, conflict: &Conflict) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO conflicts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                CONFLICT_COLUMNS
            ),
            params![
                conflict.collection().as_str(),
                conflict.record_id().as_str(),
                serde_json::to_string(&conflict.local_data)?,
                serde_json::to_string(&conflict.server_data)?,
                to_micros(conflict.local_timestamp),
                to_micros(conflict.server_timestamp),
                to_micros(conflict.detected_at),
                serde_json::to_string(&conflict.fields)?,
            ],
        )
        .map_err(storage_err)?;
        info!("Conflict opened for {}", conflict.id);
        Ok(())
    }

    /// Look up an open conflict.
    pub fn get_conflict(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM conflicts WHERE collection = ?1 AND id = ?2",
                    CONFLICT_COLUMNS
                ),
                params![id.collection.as_str(), id.record_id.as_str()],
                ConflictRow::from_row,
            )
            .optional()
            .map_err(storage_err)?;
        row.map(ConflictRow::into_conflict).transpose()
    }

    /// Whether a conflict is open for the record.
    pub fn has_conflict(&self, collection: &CollectionName, id: &RecordId) -> Result<bool> {
        let conn = self.conn()?;
        conflict_exists(&conn, collection, id)
    }

    /// All open conflicts, oldest local version first.
    pub fn list_conflicts(&self) -> Result<Vec<Conflict>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM conflicts ORDER BY local_timestamp, collection, id",
                CONFLICT_COLUMNS
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], ConflictRow::from_row)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        rows.into_iter().map(ConflictRow::into_conflict).collect()
    }

    /// Number of open conflicts.
    pub fn conflict_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conflicts", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(count as usize)
    }

    /// Commit the local half of a conflict resolution in one transaction.
    ///
    /// The record takes `payload` and is flagged synced at `server_timestamp`,
    /// its queued changes are acknowledged and the conflict is closed. Call
    /// only after any required remote write has succeeded.
    ///
    /// # Errors
    /// - `NotFound` if no conflict is open for `id`
    pub fn commit_resolution(
        &self,
        id: &ConflictId,
        payload: Payload,
        server_timestamp: DateTime<Utc>,
    ) -> Result<Record> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        if !conflict_exists(&tx, &id.collection, &id.record_id)? {
            return Err(Error::NotFound(format!("No open conflict for {}", id)));
        }

        let record = Record {
            id: id.record_id.clone(),
            collection: id.collection.clone(),
            payload,
            local_timestamp: server_timestamp,
            synced: true,
            server_timestamp: Some(server_timestamp),
        };
        upsert_record(&tx, &record)?;
        let acked = ack_all_for_record(&tx, &id.collection, &id.record_id)?;

        tx.execute(
            "DELETE FROM conflicts WHERE collection = ?1 AND id = ?2",
            params![id.collection.as_str(), id.record_id.as_str()],
        )
        .map_err(storage_err)?;

        tx.commit().map_err(storage_err)?;
        debug!("Resolved {} ({} queued change(s) acknowledged)", id, acked);
        Ok(record)
    }

    /// Acknowledge a record whose local and server values turned out equal.
    pub fn mark_converged(
        &self,
        collection: &CollectionName,
        id: &RecordId,
        server_timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        if let Some(mut record) = load_record(&tx, collection, id)? {
            record.synced = true;
            record.server_timestamp = Some(server_timestamp);
            upsert_record(&tx, &record)?;
        }
        ack_all_for_record(&tx, collection, id)?;

        tx.commit().map_err(storage_err)?;
        debug!("{}/{} converged with the server at {}", collection, id, server_timestamp);
        Ok(())
    }
}

/// Build a conflict stamped with the current detection time.
pub fn new_conflict(
    record: &Record,
    server_data: Payload,
    server_timestamp: DateTime<Utc>,
    fields: Vec<String>,
) -> Conflict {
    Conflict {
        id: ConflictId::new(record.collection.clone(), record.id.clone()),
        local_data: record.payload.clone(),
        server_data,
        local_timestamp: record.local_timestamp,
        server_timestamp,
        detected_at: now_micros(),
        fields,
    }
}
