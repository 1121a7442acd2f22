//! Record collections.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use driftwood_common::{
    now_micros, ChangeAction, CollectionName, Error, Payload, Record, RecordId, Result,
};

use crate::conflicts::conflict_exists;
use crate::queue::{insert_change, PendingChange};
use crate::store::{from_micros, storage_err, to_micros, LocalStore};

const RECORD_COLUMNS: &str =
    "collection, id, payload, local_timestamp, synced, server_timestamp";

struct RecordRow {
    collection: String,
    id: String,
    payload: String,
    local_timestamp: i64,
    synced: bool,
    server_timestamp: Option<i64>,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            collection: row.get(0)?,
            id: row.get(1)?,
            payload: row.get(2)?,
            local_timestamp: row.get(3)?,
            synced: row.get(4)?,
            server_timestamp: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<Record> {
        Ok(Record {
            id: RecordId::new(self.id)?,
            collection: CollectionName::new(self.collection)?,
            payload: serde_json::from_str(&self.payload)?,
            local_timestamp: from_micros(self.local_timestamp)?,
            synced: self.synced,
            server_timestamp: self.server_timestamp.map(from_micros).transpose()?,
        })
    }
}

pub(crate) fn load_record(
    conn: &Connection,
    collection: &CollectionName,
    id: &RecordId,
) -> Result<Option<Record>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM records WHERE collection = ?1 AND id = ?2",
                RECORD_COLUMNS
            ),
            params![collection.as_str(), id.as_str()],
            RecordRow::from_row,
        )
        .optional()
        .map_err(storage_err)?;
    row.map(RecordRow::into_record).transpose()
}

pub(crate) fn upsert_record(conn: &Connection, record: &Record) -> Result<()> {
    let payload = serde_json::to_string(&record.payload)?;
    conn.execute(
        r#"
        INSERT INTO records (collection, id, payload, local_timestamp, synced, server_timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT (collection, id) DO UPDATE SET
            payload = excluded.payload,
            local_timestamp = excluded.local_timestamp,
            synced = excluded.synced,
            server_timestamp = excluded.server_timestamp
        "#,
        params![
            record.collection.as_str(),
            record.id.as_str(),
            payload,
            to_micros(record.local_timestamp),
            record.synced,
            record.server_timestamp.map(to_micros),
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn query_records(
    conn: &Connection,
    filter: &str,
    collection: &CollectionName,
) -> Result<Vec<Record>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM records WHERE collection = ?1 {} ORDER BY local_timestamp, rowid",
            RECORD_COLUMNS, filter
        ))
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(params![collection.as_str()], RecordRow::from_row)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    rows.into_iter().map(RecordRow::into_record).collect()
}

/// A local mutation must be strictly newer than the one it replaces, even
/// when the wall clock is coarse or stepped back.
fn next_local_timestamp(previous: Option<&Record>) -> DateTime<Utc> {
    let now = now_micros();
    match previous {
        Some(prev) if prev.local_timestamp >= now => {
            prev.local_timestamp + chrono::Duration::microseconds(1)
        }
        _ => now,
    }
}

fn ensure_no_conflict(conn: &Connection, collection: &CollectionName, id: &RecordId) -> Result<()> {
    if conflict_exists(conn, collection, id)? {
        return Err(Error::ConflictDetected(format!(
            "{}/{} has an open conflict; resolve it before editing",
            collection, id
        )));
    }
    Ok(())
}

impl LocalStore {
    /// Insert or replace a record as given.
    ///
    /// Low-level: no change is queued. Use [`LocalStore::save`] for user edits.
    pub fn put(&self, collection: &CollectionName, record: &Record) -> Result<()> {
        if &record.collection != collection {
            return Err(Error::InvalidInput(format!(
                "Record {} belongs to {}, not {}",
                record.id, record.collection, collection
            )));
        }
        let conn = self.conn()?;
        upsert_record(&conn, record)
    }

    /// Get a record by id.
    pub fn get(&self, collection: &CollectionName, id: &RecordId) -> Result<Option<Record>> {
        let conn = self.conn()?;
        load_record(&conn, collection, id)
    }

    /// All records of a collection not yet confirmed on the remote store,
    /// oldest local mutation first.
    pub fn get_all_unsynced(&self, collection: &CollectionName) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        query_records(&conn, "AND synced = 0", collection)
    }

    /// All records of a collection, oldest local mutation first.
    pub fn list(&self, collection: &CollectionName) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        query_records(&conn, "", collection)
    }

    /// Flag a record as confirmed on the remote store.
    pub fn mark_synced(&self, collection: &CollectionName, id: &RecordId) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE records SET synced = 1 WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id.as_str()],
            )
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Record not found: {}/{}", collection, id)));
        }
        Ok(())
    }

    /// Remove a record row. Returns whether a row existed.
    ///
    /// Low-level: no change is queued. Use [`LocalStore::remove`] for user deletes.
    pub fn delete(&self, collection: &CollectionName, id: &RecordId) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id.as_str()],
            )
            .map_err(storage_err)?;
        Ok(deleted > 0)
    }

    /// Names of all collections holding at least one record.
    pub fn collections(&self) -> Result<Vec<CollectionName>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT collection FROM records ORDER BY collection")
            .map_err(storage_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        names.into_iter().map(CollectionName::new).collect()
    }

    /// Number of records not yet confirmed on the remote store.
    pub fn unsynced_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM records WHERE synced = 0", [], |row| {
                row.get(0)
            })
            .map_err(storage_err)?;
        Ok(count as usize)
    }

    /// Local write path: store the payload and queue the change in one
    /// transaction.
    ///
    /// # Errors
    /// - `ConflictDetected` while a conflict is open for the record
    pub fn save(
        &self,
        collection: &CollectionName,
        id: &RecordId,
        payload: Payload,
    ) -> Result<PendingChange> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        ensure_no_conflict(&tx, collection, id)?;
        let previous = load_record(&tx, collection, id)?;
        let action = if previous.is_some() {
            ChangeAction::Update
        } else {
            ChangeAction::Insert
        };

        let record = Record {
            id: id.clone(),
            collection: collection.clone(),
            payload: payload.clone(),
            local_timestamp: next_local_timestamp(previous.as_ref()),
            synced: false,
            server_timestamp: previous.and_then(|p| p.server_timestamp),
        };
        upsert_record(&tx, &record)?;

        let change = PendingChange::new(collection.clone(), id.clone(), action, Some(payload))
            .with_timestamp(record.local_timestamp);
        insert_change(&tx, &change)?;

        tx.commit().map_err(storage_err)?;
        debug!("Saved {}/{} ({})", collection, id, action);
        Ok(change)
    }

    /// Local delete path: remove the record and queue a delete in one
    /// transaction. The delete change keeps the last payload.
    ///
    /// # Errors
    /// - `NotFound` if the record does not exist
    /// - `ConflictDetected` while a conflict is open for the record
    pub fn remove(&self, collection: &CollectionName, id: &RecordId) -> Result<PendingChange> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        ensure_no_conflict(&tx, collection, id)?;
        let previous = load_record(&tx, collection, id)?
            .ok_or_else(|| Error::NotFound(format!("Record not found: {}/{}", collection, id)))?;

        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id.as_str()],
        )
        .map_err(storage_err)?;

        let change = PendingChange::new(
            collection.clone(),
            id.clone(),
            ChangeAction::Delete,
            Some(previous.payload),
        );
        insert_change(&tx, &change)?;

        tx.commit().map_err(storage_err)?;
        debug!("Removed {}/{}", collection, id);
        Ok(change)
    }
}
