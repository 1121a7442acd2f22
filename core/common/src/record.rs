//! Record shapes shared by the local store and the remote adapters.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::{CollectionName, Error, RecordId, Result};

/// Opaque record body: field name to JSON value.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Parse a JSON string into a payload, requiring a top-level object.
pub fn payload_from_str(json: &str) -> Result<Payload> {
    match serde_json::from_str::<serde_json::Value>(json)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::InvalidInput(format!(
            "Payload must be a JSON object, got: {}",
            other
        ))),
    }
}

/// Current time truncated to the microsecond precision the stores persist.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// A locally stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub collection: CollectionName,
    pub payload: Payload,
    /// Time of the last local mutation.
    pub local_timestamp: DateTime<Utc>,
    /// Whether the current payload is confirmed on the remote store.
    pub synced: bool,
    /// Last remote last-modified time acknowledged for this record.
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl Record {
    /// Create an unsynced record stamped with the current time.
    pub fn new(collection: CollectionName, id: RecordId, payload: Payload) -> Self {
        Self {
            id,
            collection,
            payload,
            local_timestamp: now_micros(),
            synced: false,
            server_timestamp: None,
        }
    }

    /// Override the local timestamp.
    pub fn with_local_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.local_timestamp = timestamp;
        self
    }

    /// Override the base server timestamp.
    pub fn with_server_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.server_timestamp = Some(timestamp);
        self
    }
}

/// The remote store's current version of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub id: RecordId,
    pub collection: CollectionName,
    pub payload: Payload,
    /// Server-assigned last-modified time.
    pub modified: DateTime<Utc>,
}
