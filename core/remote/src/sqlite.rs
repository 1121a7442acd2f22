//! SQLite file acting as the remote store.
//!
//! Lets several local stores (or several CLI invocations) share one
//! canonical copy without a server.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use driftwood_common::{
    now_micros, CollectionName, Error, Payload, RecordId, RemoteRecord, Result,
};

use crate::provider::RemoteStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS remote_records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    payload TEXT NOT NULL,
    modified INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
"#;

/// Remote store backed by a SQLite file.
///
/// Any failure talking to the file is reported as `Network`: for the sync
/// engine the remote is simply unreachable and queued changes stay queued.
pub struct SqliteRemote {
    conn: Mutex<Connection>,
}

impl SqliteRemote {
    /// Open (or create) the remote database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(unreachable)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(unreachable)?;
        conn.execute_batch(SCHEMA).map_err(unreachable)?;

        info!("SQLite remote opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Network("sqlite remote lock poisoned".to_string()))
    }
}

fn unreachable(err: rusqlite::Error) -> Error {
    Error::Network(format!("sqlite remote: {}", err))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Serialization(format!("Invalid remote timestamp: {}", micros)))
}

fn load(
    conn: &Connection,
    collection: &CollectionName,
    id: &RecordId,
) -> Result<Option<RemoteRecord>> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT payload, modified FROM remote_records WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(unreachable)?;

    match row {
        Some((payload, modified)) => Ok(Some(RemoteRecord {
            id: id.clone(),
            collection: collection.clone(),
            payload: serde_json::from_str(&payload)?,
            modified: from_micros(modified)?,
        })),
        None => Ok(None),
    }
}

#[async_trait]
impl RemoteStore for SqliteRemote {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn fetch_by_id(
        &self,
        collection: &CollectionName,
        id: &RecordId,
    ) -> Result<Option<RemoteRecord>> {
        let conn = self.conn()?;
        load(&conn, collection, id)
    }

    async fn upsert(
        &self,
        collection: &CollectionName,
        id: &RecordId,
        payload: Payload,
    ) -> Result<RemoteRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(unreachable)?;

        let mut modified = now_micros();
        if let Some(previous) = load(&tx, collection, id)? {
            if modified <= previous.modified {
                modified = previous.modified + ChronoDuration::microseconds(1);
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO remote_records (collection, id, payload, modified) VALUES (?1, ?2, ?3, ?4)",
            params![
                collection.as_str(),
                id.as_str(),
                serde_json::to_string(&payload)?,
                modified.timestamp_micros(),
            ],
        )
        .map_err(unreachable)?;
        tx.commit().map_err(unreachable)?;

        debug!("sqlite remote stored {}/{} at {}", collection, id, modified);
        Ok(RemoteRecord {
            id: id.clone(),
            collection: collection.clone(),
            payload,
            modified,
        })
    }

    async fn delete(&self, collection: &CollectionName, id: &RecordId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM remote_records WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id.as_str()],
        )
        .map_err(unreachable)?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(unreachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn animals() -> CollectionName {
        CollectionName::new("animals").unwrap()
    }

    fn rid(id: &str) -> RecordId {
        RecordId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_records_persist_across_handles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("remote.db");
        let payload = json!({"species": "cow", "weight": 40})
            .as_object()
            .cloned()
            .unwrap();

        let stored = {
            let remote = SqliteRemote::open(&path).unwrap();
            remote.upsert(&animals(), &rid("a1"), payload.clone()).await.unwrap()
        };

        let remote = SqliteRemote::open(&path).unwrap();
        let fetched = remote.fetch_by_id(&animals(), &rid("a1")).await.unwrap().unwrap();
        assert_eq!(fetched, stored);
        assert_eq!(fetched.payload, payload);
        remote.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let temp = TempDir::new().unwrap();
        let remote = SqliteRemote::open(temp.path().join("remote.db")).unwrap();
        let payload = json!({"weight": 40}).as_object().cloned().unwrap();

        let first = remote.upsert(&animals(), &rid("a1"), payload.clone()).await.unwrap();
        let second = remote.upsert(&animals(), &rid("a1"), payload).await.unwrap();
        assert!(second.modified > first.modified);

        remote.delete(&animals(), &rid("a1")).await.unwrap();
        remote.delete(&animals(), &rid("a1")).await.unwrap();
        assert!(!remote.exists(&animals(), &rid("a1")).await.unwrap());
    }

    #[test]
    fn test_open_missing_directory_is_network_error() {
        let temp = TempDir::new().unwrap();
        let result = SqliteRemote::open(temp.path().join("missing").join("remote.db"));
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
