//! Conflict resolution.
//!
//! A resolution writes the chosen payload to the remote first and only then
//! commits locally. If the remote write fails nothing local changes and the
//! conflict stays open.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use driftwood_common::{ConflictId, Error, Payload, Record, Result};
use driftwood_remote::RemoteStore;
use driftwood_store::{Conflict, LocalStore};

use crate::retry::RetryExecutor;

/// How to settle one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Keep the local version and push it.
    Local,
    /// Take the server version; no remote write.
    Server,
    /// Push a merged payload and keep it locally.
    Merge(Payload),
}

/// Automatic handling of conflicts found during a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Leave conflicts open for the user.
    #[default]
    Manual,
    PreferLocal,
    PreferServer,
}

impl ConflictPolicy {
    /// The decision this policy applies, if any.
    pub fn decision(&self) -> Option<Decision> {
        match self {
            ConflictPolicy::Manual => None,
            ConflictPolicy::PreferLocal => Some(Decision::Local),
            ConflictPolicy::PreferServer => Some(Decision::Server),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Server,
}

/// Builds a merged payload field by field.
///
/// Starts from the server version; each differing field can be switched to
/// the local value.
pub struct FieldMerge<'a> {
    conflict: &'a Conflict,
    picks: BTreeMap<String, Side>,
}

impl<'a> FieldMerge<'a> {
    pub fn new(conflict: &'a Conflict) -> Self {
        Self {
            conflict,
            picks: BTreeMap::new(),
        }
    }

    fn pick(mut self, field: &str, side: Side) -> Result<Self> {
        if !self.conflict.fields.iter().any(|f| f == field) {
            return Err(Error::InvalidInput(format!(
                "'{}' is not a conflicting field of {}",
                field, self.conflict.id
            )));
        }
        self.picks.insert(field.to_string(), side);
        Ok(self)
    }

    /// Use the local value of `field`.
    pub fn take_local(self, field: &str) -> Result<Self> {
        self.pick(field, Side::Local)
    }

    /// Use the server value of `field` (the default).
    pub fn take_server(self, field: &str) -> Result<Self> {
        self.pick(field, Side::Server)
    }

    pub fn build(self) -> Payload {
        let mut merged = self.conflict.server_data.clone();
        for (field, side) in &self.picks {
            if *side == Side::Server {
                continue;
            }
            match self.conflict.local_data.get(field) {
                Some(value) => {
                    merged.insert(field.clone(), value.clone());
                }
                None => {
                    merged.remove(field);
                }
            }
        }
        merged
    }
}

/// Outcome of resolving every open conflict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveAllReport {
    pub resolved: Vec<ConflictId>,
    pub failed: Vec<(ConflictId, String)>,
}

/// Applies decisions to open conflicts, one at a time.
pub struct ConflictResolver {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    retry: RetryExecutor,
    lock: Mutex<()>,
}

impl ConflictResolver {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            store,
            remote,
            retry,
            lock: Mutex::new(()),
        }
    }

    /// Resolve one conflict.
    ///
    /// # Postconditions
    /// - On success the record holds the chosen payload, is synced, its
    ///   queued changes are acknowledged and the conflict is gone
    /// - On failure nothing local changed
    ///
    /// # Errors
    /// - `NotFound` if no conflict is open for `id`
    /// - `ResolutionFailed` if the remote write failed
    pub async fn resolve_one(&self, id: &ConflictId, decision: Decision) -> Result<Record> {
        let _guard = self.lock.lock().await;

        let conflict = self
            .store
            .get_conflict(id)?
            .ok_or_else(|| Error::NotFound(format!("No open conflict for {}", id)))?;

        let (payload, server_timestamp) = match decision {
            Decision::Server => (conflict.server_data, conflict.server_timestamp),
            Decision::Local => self.push(&conflict, conflict.local_data.clone()).await?,
            Decision::Merge(payload) => self.push(&conflict, payload).await?,
        };

        let record = self.store.commit_resolution(id, payload, server_timestamp)?;
        info!("Resolved conflict {}", id);
        Ok(record)
    }

    async fn push(
        &self,
        conflict: &Conflict,
        payload: Payload,
    ) -> Result<(Payload, chrono::DateTime<chrono::Utc>)> {
        let stored = self
            .retry
            .execute(|| {
                self.remote
                    .upsert(conflict.collection(), conflict.record_id(), payload.clone())
            })
            .await
            .map_err(|err| {
                warn!("Remote write for {} failed: {}", conflict.id, err);
                Error::ResolutionFailed(format!("{}: {}", conflict.id, err))
            })?;
        Ok((stored.payload, stored.modified))
    }

    /// Resolve every open conflict with the same decision, oldest first.
    ///
    /// Every conflict is attempted; failures are collected, not returned
    /// early. Only listing the conflicts can fail the call itself.
    pub async fn resolve_all(&self, decision: &Decision) -> Result<ResolveAllReport> {
        let mut report = ResolveAllReport::default();
        for conflict in self.store.list_conflicts()? {
            match self.resolve_one(&conflict.id, decision.clone()).await {
                Ok(_) => report.resolved.push(conflict.id),
                Err(err) => report.failed.push((conflict.id, err.to_string())),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use driftwood_common::{CollectionName, RecordId};
    use driftwood_remote::MemoryRemote;
    use driftwood_store::new_conflict;
    use serde_json::{json, Value};

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn animals() -> CollectionName {
        CollectionName::new("animals").unwrap()
    }

    fn rid(id: &str) -> RecordId {
        RecordId::new(id).unwrap()
    }

    struct Fixture {
        store: Arc<LocalStore>,
        remote: Arc<MemoryRemote>,
        resolver: ConflictResolver,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let resolver = ConflictResolver::new(
            store.clone(),
            remote.clone(),
            RetryExecutor::new(
                crate::retry::RetryConfig::new(0)
                    .with_request_timeout(std::time::Duration::from_secs(1)),
            ),
        );
        Fixture {
            store,
            remote,
            resolver,
        }
    }

    /// Local cow at 40, server cow at 45 five seconds later.
    fn open_cow_conflict(f: &Fixture, id: &str) -> ConflictId {
        f.store
            .save(&animals(), &rid(id), payload(json!({"species": "cow", "weight": 40})))
            .unwrap();
        let record = f.store.get(&animals(), &rid(id)).unwrap().unwrap();
        let server_ts = record.local_timestamp + ChronoDuration::seconds(5);
        let server = payload(json!({"species": "cow", "weight": 45}));
        f.remote
            .put_at(&animals(), &rid(id), server.clone(), server_ts)
            .unwrap();
        let conflict = new_conflict(&record, server, server_ts, vec!["weight".to_string()]);
        f.store.open_conflict(&conflict).unwrap();
        conflict.id
    }

    #[tokio::test]
    async fn test_resolve_server() {
        let f = fixture();
        let id = open_cow_conflict(&f, "a1");

        let record = f.resolver.resolve_one(&id, Decision::Server).await.unwrap();

        assert_eq!(record.payload.get("weight"), Some(&json!(45)));
        assert!(record.synced);
        assert_eq!(f.remote.write_count(), 0);
        assert_eq!(f.store.conflict_count().unwrap(), 0);
        assert_eq!(f.store.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resolve_local() {
        let f = fixture();
        let id = open_cow_conflict(&f, "a1");

        let record = f.resolver.resolve_one(&id, Decision::Local).await.unwrap();

        let remote = f.remote.get(&animals(), &rid("a1")).unwrap();
        assert_eq!(remote.payload.get("weight"), Some(&json!(40)));
        assert_eq!(record.payload, remote.payload);
        assert_eq!(record.server_timestamp, Some(remote.modified));
        assert_eq!(f.store.conflict_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resolve_merge() {
        let f = fixture();
        let id = open_cow_conflict(&f, "a1");
        let merged = payload(json!({"species": "cow", "weight": 43}));

        let record = f
            .resolver
            .resolve_one(&id, Decision::Merge(merged.clone()))
            .await
            .unwrap();

        assert_eq!(record.payload, merged);
        assert_eq!(f.remote.get(&animals(), &rid("a1")).unwrap().payload, merged);
    }

    #[tokio::test]
    async fn test_failed_remote_write_changes_nothing() {
        let f = fixture();
        let id = open_cow_conflict(&f, "a1");
        f.remote.set_offline(true);

        let result = f.resolver.resolve_one(&id, Decision::Local).await;
        assert!(matches!(result, Err(Error::ResolutionFailed(_))));

        let record = f.store.get(&animals(), &rid("a1")).unwrap().unwrap();
        assert!(!record.synced);
        assert_eq!(record.payload.get("weight"), Some(&json!(40)));
        assert_eq!(f.store.conflict_count().unwrap(), 1);
        assert_eq!(f.store.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_conflict() {
        let f = fixture();
        let id = ConflictId::new(animals(), rid("missing"));

        assert!(matches!(
            f.resolver.resolve_one(&id, Decision::Server).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_all_continues_past_failures() {
        let f = fixture();
        open_cow_conflict(&f, "a1");
        let failing = open_cow_conflict(&f, "a2");
        open_cow_conflict(&f, "a3");
        f.remote.set_unreachable(&animals(), &rid("a2"), true);

        let report = f.resolver.resolve_all(&Decision::Local).await.unwrap();

        assert_eq!(report.resolved.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, failing);
        assert_eq!(f.store.conflict_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resolve_is_deterministic() {
        let f = fixture();
        let id = open_cow_conflict(&f, "a1");

        let record = f.resolver.resolve_one(&id, Decision::Local).await.unwrap();
        let remote = f.remote.get(&animals(), &rid("a1")).unwrap();

        assert_eq!(record.payload, remote.payload);
        assert!(f.store.get(&animals(), &rid("a1")).unwrap().unwrap().synced);
    }

    #[test]
    fn test_field_merge() {
        let record = Record::new(
            animals(),
            rid("a1"),
            payload(json!({"species": "cow", "weight": 40, "tag": "red"})),
        );
        let conflict = new_conflict(
            &record,
            payload(json!({"species": "cow", "weight": 45, "pen": 3})),
            record.local_timestamp + ChronoDuration::seconds(1),
            vec!["pen".into(), "tag".into(), "weight".into()],
        );

        let merged = FieldMerge::new(&conflict)
            .take_local("weight")
            .unwrap()
            .take_local("pen")
            .unwrap()
            .take_server("tag")
            .unwrap()
            .build();
        assert_eq!(merged, payload(json!({"species": "cow", "weight": 40})));

        assert!(FieldMerge::new(&conflict).take_local("species").is_err());
    }

    #[test]
    fn test_policy_decisions() {
        assert_eq!(ConflictPolicy::Manual.decision(), None);
        assert_eq!(ConflictPolicy::PreferLocal.decision(), Some(Decision::Local));
        assert_eq!(ConflictPolicy::PreferServer.decision(), Some(Decision::Server));
    }
}
