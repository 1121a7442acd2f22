//! Conflict detection.
//!
//! A conflict exists when the local record is unsynced and the remote holds
//! a strictly newer version whose payload differs. Newer is judged by
//! timestamps (last writer wins); equal payloads are treated as converged.

use std::collections::BTreeSet;

use driftwood_common::{Payload, Record, RemoteRecord, Result};
use driftwood_remote::RemoteStore;
use driftwood_store::{new_conflict, Conflict};

/// Fields that describe bookkeeping rather than content.
pub const DEFAULT_IGNORED_FIELDS: &[&str] = &[
    "id",
    "synced",
    "localTimestamp",
    "serverTimestamp",
    "createdAt",
    "updatedAt",
    "created_at",
    "updated_at",
    "lastModified",
];

/// Top-level fields whose values differ between two payloads, sorted.
///
/// A field present on one side only counts as different.
pub fn diff_fields(local: &Payload, server: &Payload, ignored: &[String]) -> Vec<String> {
    let keys: BTreeSet<&String> = local.keys().chain(server.keys()).collect();
    keys.into_iter()
        .filter(|key| !ignored.iter().any(|ignored| ignored == *key))
        .filter(|key| local.get(key.as_str()) != server.get(key.as_str()))
        .cloned()
        .collect()
}

/// Outcome of checking one record against the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// The record does not exist remotely.
    NoRemote,
    /// The local version is at least as new as the remote one.
    LocalNewer,
    /// The remote is newer but carries the same content.
    Converged(RemoteRecord),
    Conflict(Conflict),
}

/// Compares local records with their remote versions.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    ignored_fields: Vec<String>,
}

impl ConflictDetector {
    pub fn new(ignored_fields: Vec<String>) -> Self {
        Self { ignored_fields }
    }

    pub fn ignored_fields(&self) -> &[String] {
        &self.ignored_fields
    }

    /// Classify a local record against an already fetched remote version.
    pub fn classify(&self, local: &Record, remote: Option<RemoteRecord>) -> Detection {
        let remote = match remote {
            Some(remote) => remote,
            None => return Detection::NoRemote,
        };

        if remote.modified <= local.local_timestamp {
            return Detection::LocalNewer;
        }

        let fields = diff_fields(&local.payload, &remote.payload, &self.ignored_fields);
        if fields.is_empty() {
            return Detection::Converged(remote);
        }

        Detection::Conflict(new_conflict(local, remote.payload, remote.modified, fields))
    }

    /// Fetch the remote version of `local` and classify it.
    pub async fn detect(&self, remote: &dyn RemoteStore, local: &Record) -> Result<Detection> {
        let current = remote.fetch_by_id(&local.collection, &local.id).await?;
        Ok(self.classify(local, current))
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(
            DEFAULT_IGNORED_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
        )
    }
}
