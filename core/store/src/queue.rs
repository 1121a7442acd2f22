//! Pending change queue.
//!
//! An ordered log of local mutations that the remote store has not yet
//! acknowledged. Items are kept after acknowledgment until pruned, which
//! leaves an audit trail for conflict forensics.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use driftwood_common::{
    now_micros, ChangeAction, CollectionName, Error, Payload, RecordId, Result,
};

use crate::store::{from_micros, storage_err, to_micros, LocalStore};

/// Why the last push of a change did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient transport failure; retried on the next sync.
    Network,
    /// The remote refused the payload; not retried until the record changes.
    Rejected,
    /// The remote holds a newer version; routed to conflict detection.
    VersionMismatch,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::Rejected => "rejected",
            FailureKind::VersionMismatch => "version_mismatch",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "network" => Ok(FailureKind::Network),
            "rejected" => Ok(FailureKind::Rejected),
            "version_mismatch" => Ok(FailureKind::VersionMismatch),
            other => Err(Error::Storage(format!("Unknown failure kind: {}", other))),
        }
    }
}

/// A queued local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    /// Unique ID for this change.
    pub id: String,
    pub collection: CollectionName,
    pub record_id: RecordId,
    pub action: ChangeAction,
    /// Payload snapshot; for deletes, the last known payload.
    pub payload: Option<Payload>,
    /// When the change was made locally.
    pub timestamp: DateTime<Utc>,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
    /// Number of failed push attempts.
    pub attempts: u32,
    pub last_failure: Option<FailureKind>,
    pub last_error: Option<String>,
}

impl PendingChange {
    /// Create a new unsynced change stamped with the current time.
    pub fn new(
        collection: CollectionName,
        record_id: RecordId,
        action: ChangeAction,
        payload: Option<Payload>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            collection,
            record_id,
            action,
            payload,
            timestamp: now_micros(),
            synced: false,
            synced_at: None,
            attempts: 0,
            last_failure: None,
            last_error: None,
        }
    }

    /// Override the change timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the remote refused this exact payload.
    pub fn is_rejected(&self) -> bool {
        self.last_failure == Some(FailureKind::Rejected)
    }
}

const CHANGE_COLUMNS: &str = "change_id, collection, record_id, action, payload, timestamp, \
     synced, synced_at, attempts, last_failure, last_error";

struct ChangeRow {
    id: String,
    collection: String,
    record_id: String,
    action: String,
    payload: Option<String>,
    timestamp: i64,
    synced: bool,
    synced_at: Option<i64>,
    attempts: u32,
    last_failure: Option<String>,
    last_error: Option<String>,
}

impl ChangeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            collection: row.get(1)?,
            record_id: row.get(2)?,
            action: row.get(3)?,
            payload: row.get(4)?,
            timestamp: row.get(5)?,
            synced: row.get(6)?,
            synced_at: row.get(7)?,
            attempts: row.get(8)?,
            last_failure: row.get(9)?,
            last_error: row.get(10)?,
        })
    }

    fn into_change(self) -> Result<PendingChange> {
        let payload = match self.payload {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(PendingChange {
            id: self.id,
            collection: CollectionName::new(self.collection)?,
            record_id: RecordId::new(self.record_id)?,
            action: self.action.parse()?,
            payload,
            timestamp: from_micros(self.timestamp)?,
            synced: self.synced,
            synced_at: self.synced_at.map(from_micros).transpose()?,
            attempts: self.attempts,
            last_failure: self
                .last_failure
                .as_deref()
                .map(str::parse::<FailureKind>)
                .transpose()?,
            last_error: self.last_error,
        })
    }
}

/// Append a change inside an open transaction.
pub(crate) fn insert_change(conn: &Connection, change: &PendingChange) -> Result<()> {
    let payload = change
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT INTO pending_changes
        (change_id, collection, record_id, action, payload, timestamp, synced, synced_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            change.id,
            change.collection.as_str(),
            change.record_id.as_str(),
            change.action.as_str(),
            payload,
            to_micros(change.timestamp),
            change.synced,
            change.synced_at.map(to_micros),
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

/// Acknowledge every unsynced change of a record up to and including `seq`.
fn ack_through(
    conn: &Connection,
    collection: &CollectionName,
    record_id: &RecordId,
    seq: i64,
) -> Result<usize> {
    conn.execute(
        r#"
        UPDATE pending_changes SET synced = 1, synced_at = ?1
        WHERE collection = ?2 AND record_id = ?3 AND synced = 0 AND seq <= ?4
        "#,
        params![
            to_micros(now_micros()),
            collection.as_str(),
            record_id.as_str(),
            seq
        ],
    )
    .map_err(storage_err)
}

/// Acknowledge every unsynced change of a record.
pub(crate) fn ack_all_for_record(
    conn: &Connection,
    collection: &CollectionName,
    record_id: &RecordId,
) -> Result<usize> {
    ack_through(conn, collection, record_id, i64::MAX)
}

impl LocalStore {
    /// Append a change to the queue.
    ///
    /// Never touches the network; fails only on storage errors.
    pub fn enqueue(&self, change: &PendingChange) -> Result<()> {
        let conn = self.conn()?;
        insert_change(&conn, change)?;
        debug!(
            "Enqueued {} {} for {}/{}",
            change.action, change.id, change.collection, change.record_id
        );
        Ok(())
    }

    /// All unsynced changes, in the order they were enqueued.
    ///
    /// Items stay in the queue until acknowledged.
    pub fn drain(&self) -> Result<Vec<PendingChange>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM pending_changes WHERE synced = 0 ORDER BY seq",
                CHANGE_COLUMNS
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], ChangeRow::from_row)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        rows.into_iter().map(ChangeRow::into_change).collect()
    }

    /// Mark a single change as acknowledged by the remote store.
    pub fn ack(&self, change_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE pending_changes SET synced = 1, synced_at = ?1 WHERE change_id = ?2",
                params![to_micros(now_micros()), change_id],
            )
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Pending change not found: {}", change_id)));
        }
        Ok(())
    }

    /// Acknowledge a pushed change and update its record, atomically.
    ///
    /// Earlier unsynced changes of the same record are acknowledged too: each
    /// change carries a full snapshot, so the pushed one supersedes them. The
    /// record's base server timestamp moves to `server_timestamp`; the record
    /// is flagged synced only when no later change for it is still queued.
    pub fn ack_and_mark_synced(
        &self,
        change: &PendingChange,
        server_timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        let seq: i64 = tx
            .query_row(
                "SELECT seq FROM pending_changes WHERE change_id = ?1",
                params![change.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?
            .ok_or_else(|| Error::NotFound(format!("Pending change not found: {}", change.id)))?;

        let acked = ack_through(&tx, &change.collection, &change.record_id, seq)?;

        let remaining: i64 = tx
            .query_row(
                r#"
                SELECT COUNT(*) FROM pending_changes
                WHERE collection = ?1 AND record_id = ?2 AND synced = 0
                "#,
                params![change.collection.as_str(), change.record_id.as_str()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;

        tx.execute(
            r#"
            UPDATE records
            SET server_timestamp = COALESCE(?1, server_timestamp),
                synced = CASE WHEN ?2 = 0 THEN 1 ELSE synced END
            WHERE collection = ?3 AND id = ?4
            "#,
            params![
                server_timestamp.map(to_micros),
                remaining,
                change.collection.as_str(),
                change.record_id.as_str(),
            ],
        )
        .map_err(storage_err)?;

        tx.commit().map_err(storage_err)?;
        debug!(
            "Acknowledged {} change(s) for {}/{} ({} still queued)",
            acked, change.collection, change.record_id, remaining
        );
        Ok(())
    }

    /// Record a failed push attempt.
    pub fn record_failure(&self, change_id: &str, kind: FailureKind, message: &str) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                r#"
                UPDATE pending_changes
                SET attempts = attempts + 1, last_failure = ?1, last_error = ?2
                WHERE change_id = ?3
                "#,
                params![kind.as_str(), message, change_id],
            )
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Pending change not found: {}", change_id)));
        }
        Ok(())
    }

    /// Number of unsynced changes.
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pending_changes WHERE synced = 0",
                [],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as usize)
    }

    /// Highest queue position handed out so far.
    pub fn last_queue_position(&self) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM pending_changes", [], |row| {
            row.get(0)
        })
        .map_err(storage_err)
    }

    /// Look up a change by id.
    pub fn get_change(&self, change_id: &str) -> Result<Option<PendingChange>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM pending_changes WHERE change_id = ?1",
                    CHANGE_COLUMNS
                ),
                params![change_id],
                ChangeRow::from_row,
            )
            .optional()
            .map_err(storage_err)?;
        row.map(ChangeRow::into_change).transpose()
    }

    /// Full change history of a record, acknowledged or not, oldest first.
    pub fn changes_for(
        &self,
        collection: &CollectionName,
        record_id: &RecordId,
    ) -> Result<Vec<PendingChange>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM pending_changes WHERE collection = ?1 AND record_id = ?2 ORDER BY seq",
                CHANGE_COLUMNS
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(
                params![collection.as_str(), record_id.as_str()],
                ChangeRow::from_row,
            )
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        rows.into_iter().map(ChangeRow::into_change).collect()
    }

    /// Delete acknowledged changes that were synced before `cutoff`.
    ///
    /// Unsynced changes are never pruned.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM pending_changes WHERE synced = 1 AND synced_at < ?1",
                params![to_micros(cutoff)],
            )
            .map_err(storage_err)?;
        if removed > 0 {
            info!("Pruned {} acknowledged change(s)", removed);
        }
        Ok(removed)
    }

    /// Prune acknowledged changes older than the retention window.
    ///
    /// # Errors
    /// - `InvalidInput` if the window reaches before the earliest
    ///   representable time
    pub fn prune_expired(&self, retention: Duration) -> Result<usize> {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .ok_or_else(|| {
                Error::InvalidInput(format!("Retention out of range: {:?}", retention))
            })?;
        self.prune(cutoff)
    }
}
