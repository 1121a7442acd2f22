//! Table layout of the local store.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

/// Current on-disk schema version.
pub(crate) const SCHEMA_VERSION: i64 = 1;

const CREATE_TABLES: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS records (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        payload TEXT NOT NULL,
        local_timestamp INTEGER NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        server_timestamp INTEGER,
        PRIMARY KEY (collection, id)
    );

    CREATE INDEX IF NOT EXISTS idx_records_unsynced
        ON records(collection, synced, local_timestamp);

    CREATE TABLE IF NOT EXISTS pending_changes (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        change_id TEXT NOT NULL UNIQUE,
        collection TEXT NOT NULL,
        record_id TEXT NOT NULL,
        action TEXT NOT NULL,
        payload TEXT,
        timestamp INTEGER NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        synced_at INTEGER,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_failure TEXT,
        last_error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_pending_synced
        ON pending_changes(synced, timestamp);
    CREATE INDEX IF NOT EXISTS idx_pending_record
        ON pending_changes(collection, record_id, synced);

    CREATE TABLE IF NOT EXISTS conflicts (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        local_data TEXT NOT NULL,
        server_data TEXT NOT NULL,
        local_timestamp INTEGER NOT NULL,
        server_timestamp INTEGER NOT NULL,
        detected_at INTEGER NOT NULL,
        fields TEXT NOT NULL,
        PRIMARY KEY (collection, id)
    );

    CREATE TABLE IF NOT EXISTS sync_status (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

const DROP_TABLES: &str = r#"
    DROP TABLE IF EXISTS records;
    DROP TABLE IF EXISTS pending_changes;
    DROP TABLE IF EXISTS conflicts;
    DROP TABLE IF EXISTS sync_status;
    DROP TABLE IF EXISTS schema_version;
"#;

/// Create missing tables and stamp the schema version.
pub(crate) fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_TABLES)?;

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    match version {
        Some(v) => debug!("Local store schema at version {}", v),
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            info!("Initialized local store schema v{}", SCHEMA_VERSION);
        }
    }

    Ok(())
}

/// Drop every table and recreate an empty schema.
pub(crate) fn recreate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(DROP_TABLES)?;
    migrate(conn)
}
