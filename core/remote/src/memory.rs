//! In-memory remote store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

use driftwood_common::{
    now_micros, CollectionName, Error, Payload, RecordId, RemoteRecord, Result,
};

use crate::provider::RemoteStore;

type Key = (String, String);

fn key(collection: &CollectionName, id: &RecordId) -> Key {
    (collection.as_str().to_string(), id.as_str().to_string())
}

#[derive(Default)]
struct State {
    records: HashMap<Key, RemoteRecord>,
    unreachable: HashSet<Key>,
    rejected: HashSet<Key>,
    /// Last modified time handed out, so every write is strictly newer.
    last_modified: Option<DateTime<Utc>>,
}

impl State {
    fn next_modified(&mut self) -> DateTime<Utc> {
        let now = now_micros();
        let modified = match self.last_modified {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_modified = Some(modified);
        modified
    }
}

/// In-memory remote store.
///
/// All data is lost on drop. Faults can be injected to exercise every
/// failure path of the sync engine:
/// - `set_offline`: every call fails with `Network`
/// - `set_unreachable`: calls for one record fail with `Network`
/// - `reject`: writes of one record fail with `RemoteRejected`
/// - `set_unauthorized`: every call fails with `Unauthorized`
/// - `set_latency`: every call sleeps first
pub struct MemoryRemote {
    state: RwLock<State>,
    offline: AtomicBool,
    unauthorized: AtomicBool,
    latency_micros: AtomicU64,
    writes: AtomicUsize,
    fetches: AtomicUsize,
}

impl MemoryRemote {
    /// Create a new empty remote.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            offline: AtomicBool::new(false),
            unauthorized: AtomicBool::new(false),
            latency_micros: AtomicU64::new(0),
            writes: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::Network("memory remote lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::Network("memory remote lock poisoned".to_string()))
    }

    /// Simulate losing (or regaining) the network.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Simulate refused credentials.
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.unauthorized.store(unauthorized, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_micros
            .store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    /// Make calls for one record fail with a network error.
    pub fn set_unreachable(&self, collection: &CollectionName, id: &RecordId, unreachable: bool) {
        if let Ok(mut state) = self.write() {
            if unreachable {
                state.unreachable.insert(key(collection, id));
            } else {
                state.unreachable.remove(&key(collection, id));
            }
        }
    }

    /// Make writes of one record fail validation.
    pub fn reject(&self, collection: &CollectionName, id: &RecordId, rejected: bool) {
        if let Ok(mut state) = self.write() {
            if rejected {
                state.rejected.insert(key(collection, id));
            } else {
                state.rejected.remove(&key(collection, id));
            }
        }
    }

    /// Edit a record server-side with an explicit modified time.
    ///
    /// Bypasses fault injection and the write counter; this is another
    /// client's write, not ours.
    pub fn put_at(
        &self,
        collection: &CollectionName,
        id: &RecordId,
        payload: Payload,
        modified: DateTime<Utc>,
    ) -> Result<RemoteRecord> {
        let mut state = self.write()?;
        let record = RemoteRecord {
            id: id.clone(),
            collection: collection.clone(),
            payload,
            modified,
        };
        state.records.insert(key(collection, id), record.clone());
        if state.last_modified.map_or(true, |last| modified > last) {
            state.last_modified = Some(modified);
        }
        Ok(record)
    }

    /// Edit a record server-side now.
    pub fn put(
        &self,
        collection: &CollectionName,
        id: &RecordId,
        payload: Payload,
    ) -> Result<RemoteRecord> {
        let modified = self.write()?.next_modified();
        self.put_at(collection, id, payload, modified)
    }

    /// Inspect a record without going through the trait (no faults).
    pub fn get(&self, collection: &CollectionName, id: &RecordId) -> Option<RemoteRecord> {
        self.read()
            .ok()
            .and_then(|state| state.records.get(&key(collection, id)).cloned())
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.read().map(|state| state.records.len()).unwrap_or(0)
    }

    /// Whether the remote holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful upserts and deletes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of fetch calls, successful or not.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn enter(&self, collection: &CollectionName, id: &RecordId) -> Result<()> {
        let latency = self.latency_micros.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
        self.check_reachable()?;
        if self.read()?.unreachable.contains(&key(collection, id)) {
            return Err(Error::Network(format!(
                "{}/{} is unreachable",
                collection, id
            )));
        }
        Ok(())
    }

    fn check_reachable(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("memory remote is offline".to_string()));
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(Error::Unauthorized("credentials refused".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_by_id(
        &self,
        collection: &CollectionName,
        id: &RecordId,
    ) -> Result<Option<RemoteRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.enter(collection, id).await?;
        Ok(self.read()?.records.get(&key(collection, id)).cloned())
    }

    async fn upsert(
        &self,
        collection: &CollectionName,
        id: &RecordId,
        payload: Payload,
    ) -> Result<RemoteRecord> {
        self.enter(collection, id).await?;
        let mut state = self.write()?;
        if state.rejected.contains(&key(collection, id)) {
            return Err(Error::RemoteRejected(format!(
                "{}/{} failed validation",
                collection, id
            )));
        }

        let record = RemoteRecord {
            id: id.clone(),
            collection: collection.clone(),
            payload,
            modified: state.next_modified(),
        };
        state.records.insert(key(collection, id), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!("memory remote stored {}/{} at {}", collection, id, record.modified);
        Ok(record)
    }

    async fn delete(&self, collection: &CollectionName, id: &RecordId) -> Result<()> {
        self.enter(collection, id).await?;
        let mut state = self.write()?;
        if state.rejected.contains(&key(collection, id)) {
            return Err(Error::RemoteRejected(format!(
                "{}/{} cannot be deleted",
                collection, id
            )));
        }
        state.records.remove(&key(collection, id));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn animals() -> CollectionName {
        CollectionName::new("animals").unwrap()
    }

    fn rid(id: &str) -> RecordId {
        RecordId::new(id).unwrap()
    }

    fn payload(weight: i64) -> Payload {
        json!({"species": "cow", "weight": weight})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_fetch() {
        let remote = MemoryRemote::new();

        let stored = remote.upsert(&animals(), &rid("a1"), payload(40)).await.unwrap();
        let fetched = remote.fetch_by_id(&animals(), &rid("a1")).await.unwrap().unwrap();

        assert_eq!(fetched, stored);
        assert_eq!(remote.write_count(), 1);
        assert!(remote.exists(&animals(), &rid("a1")).await.unwrap());
        assert!(!remote.exists(&animals(), &rid("a2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_modified_strictly_increases() {
        let remote = MemoryRemote::new();

        let first = remote.upsert(&animals(), &rid("a1"), payload(40)).await.unwrap();
        let second = remote.upsert(&animals(), &rid("a1"), payload(41)).await.unwrap();

        assert!(second.modified > first.modified);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let remote = MemoryRemote::new();
        remote.upsert(&animals(), &rid("a1"), payload(40)).await.unwrap();

        remote.delete(&animals(), &rid("a1")).await.unwrap();
        remote.delete(&animals(), &rid("a1")).await.unwrap();

        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_offline_fails_with_network() {
        let remote = MemoryRemote::new();
        remote.set_offline(true);

        assert!(matches!(
            remote.upsert(&animals(), &rid("a1"), payload(40)).await,
            Err(Error::Network(_))
        ));
        assert!(matches!(remote.ping().await, Err(Error::Network(_))));
        assert_eq!(remote.write_count(), 0);

        remote.set_offline(false);
        remote.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let remote = MemoryRemote::new();
        remote.set_unreachable(&animals(), &rid("a3"), true);
        remote.reject(&animals(), &rid("a4"), true);

        assert!(matches!(
            remote.fetch_by_id(&animals(), &rid("a3")).await,
            Err(Error::Network(_))
        ));
        assert!(matches!(
            remote.upsert(&animals(), &rid("a4"), payload(40)).await,
            Err(Error::RemoteRejected(_))
        ));
        remote.upsert(&animals(), &rid("a5"), payload(40)).await.unwrap();

        remote.set_unauthorized(true);
        assert!(matches!(
            remote.upsert(&animals(), &rid("a5"), payload(41)).await,
            Err(Error::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_server_side_edit_bypasses_faults() {
        let remote = MemoryRemote::new();
        remote.set_offline(true);
        let modified = now_micros() + ChronoDuration::seconds(10);

        remote.put_at(&animals(), &rid("a1"), payload(45), modified).unwrap();

        assert_eq!(remote.get(&animals(), &rid("a1")).unwrap().modified, modified);
        assert_eq!(remote.write_count(), 0);

        // Later writes stay newer than the explicit timestamp.
        remote.set_offline(false);
        let next = remote.upsert(&animals(), &rid("a1"), payload(46)).await.unwrap();
        assert!(next.modified > modified);
    }
}
