//! Remote store trait definition.

use async_trait::async_trait;

use driftwood_common::{CollectionName, Payload, RecordId, RemoteRecord, Result};

/// The remote canonical data store, seen as a keyed CRUD API.
///
/// Implementations own transport, authentication and rate limiting. Error
/// semantics are shared by every adapter:
/// - `Network` for transient failures (unreachable, timeout, 5xx)
/// - `RemoteRejected` when the payload fails server-side validation
/// - `Unauthorized` when the credentials are refused
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the adapter name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Fetch the current remote version of a record.
    ///
    /// # Postconditions
    /// - Returns `None` when the record does not exist remotely
    async fn fetch_by_id(
        &self,
        collection: &CollectionName,
        id: &RecordId,
    ) -> Result<Option<RemoteRecord>>;

    /// Create or replace a record.
    ///
    /// # Postconditions
    /// - The remote holds `payload` for the record
    /// - Returns the stored version with its server-assigned modified time
    async fn upsert(
        &self,
        collection: &CollectionName,
        id: &RecordId,
        payload: Payload,
    ) -> Result<RemoteRecord>;

    /// Delete a record.
    ///
    /// Deleting a record that does not exist succeeds.
    async fn delete(&self, collection: &CollectionName, id: &RecordId) -> Result<()>;

    /// Check if a record exists remotely.
    async fn exists(&self, collection: &CollectionName, id: &RecordId) -> Result<bool> {
        Ok(self.fetch_by_id(collection, id).await?.is_some())
    }

    /// Cheap reachability check used by connectivity probes.
    async fn ping(&self) -> Result<()>;
}
