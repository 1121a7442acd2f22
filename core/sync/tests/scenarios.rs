//! End-to-end sync scenarios against the in-memory remote.

use chrono::Duration as ChronoDuration;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use driftwood_common::{CollectionName, Error, Payload, RecordId};
use driftwood_remote::MemoryRemote;
use driftwood_store::{FailureKind, LocalStore};
use driftwood_sync::{
    ConnectivityMonitor, Decision, ManualConnectivity, SyncConfig, SyncOrchestrator, SyncOutcome,
    SyncReport, SyncState,
};

fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap()
}

fn animals() -> CollectionName {
    CollectionName::new("animals").unwrap()
}

fn rid(id: &str) -> RecordId {
    RecordId::new(id).unwrap()
}

fn config() -> SyncConfig {
    SyncConfig {
        max_retries: 0,
        retry_initial_delay: Duration::from_millis(1),
        request_timeout: Duration::from_secs(2),
        ..SyncConfig::default()
    }
}

struct Harness {
    store: Arc<LocalStore>,
    remote: Arc<MemoryRemote>,
    connectivity: Arc<ManualConnectivity>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(LocalStore::in_memory().unwrap(), Arc::new(MemoryRemote::new()))
    }

    fn with_store(store: LocalStore, remote: Arc<MemoryRemote>) -> Self {
        let store = Arc::new(store);
        let connectivity = Arc::new(ManualConnectivity::online());
        let orchestrator = Arc::new(
            SyncOrchestrator::new(store.clone(), remote.clone(), connectivity.clone(), config())
                .unwrap(),
        );
        Self {
            store,
            remote,
            connectivity,
            orchestrator,
        }
    }

    fn save(&self, id: &str, body: Value) {
        self.store.save(&animals(), &rid(id), payload(body)).unwrap();
    }

    async fn sync(&self) -> SyncReport {
        match self.orchestrator.sync().await {
            SyncOutcome::Completed(report) => report,
            other => panic!("expected a completed run, got {other:?}"),
        }
    }

    /// Server-side edit stamped `secs` after the local version.
    fn edit_remote_after_local(&self, id: &str, body: Value, secs: i64) {
        let local = self.store.get(&animals(), &rid(id)).unwrap().unwrap();
        self.remote
            .put_at(
                &animals(),
                &rid(id),
                payload(body),
                local.local_timestamp + ChronoDuration::seconds(secs),
            )
            .unwrap();
    }
}

#[tokio::test]
async fn cow_conflict_resolved_with_server_version() {
    let h = Harness::new();
    h.connectivity.set_offline();
    h.save("a1", json!({"species": "cow", "weight": 40}));
    h.edit_remote_after_local("a1", json!({"species": "cow", "weight": 45}), 5);
    h.connectivity.set_online();

    let report = h.sync().await;

    assert_eq!(report.conflicts_found, 1);
    let conflicts = h.orchestrator.open_conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].fields, vec!["weight".to_string()]);
    assert_eq!(conflicts[0].local_data.get("weight"), Some(&json!(40)));
    assert_eq!(conflicts[0].server_data.get("weight"), Some(&json!(45)));

    let record = h
        .orchestrator
        .resolve_one(&conflicts[0].id, Decision::Server)
        .await
        .unwrap();

    assert_eq!(record.payload.get("weight"), Some(&json!(45)));
    let stored = h.store.get(&animals(), &rid("a1")).unwrap().unwrap();
    assert!(stored.synced);
    assert_eq!(stored.payload.get("weight"), Some(&json!(45)));
    assert_eq!(h.store.pending_count().unwrap(), 0);
    assert_eq!(h.orchestrator.status().conflicts, 0);
}

#[tokio::test]
async fn cow_conflict_resolved_with_local_version() {
    let h = Harness::new();
    h.save("a1", json!({"species": "cow", "weight": 40}));
    h.edit_remote_after_local("a1", json!({"species": "cow", "weight": 45}), 5);
    h.sync().await;

    let id = h.orchestrator.open_conflicts().unwrap()[0].id.clone();
    h.orchestrator.resolve_one(&id, Decision::Local).await.unwrap();

    let remote = h.remote.get(&animals(), &rid("a1")).unwrap();
    assert_eq!(remote.payload.get("weight"), Some(&json!(40)));
    let stored = h.store.get(&animals(), &rid("a1")).unwrap().unwrap();
    assert_eq!(stored.payload, remote.payload);
    assert!(stored.synced);

    // Nothing left to push afterwards.
    let writes = h.remote.write_count();
    let report = h.sync().await;
    assert_eq!(report.pushed, 0);
    assert_eq!(h.remote.write_count(), writes);
}

#[tokio::test]
async fn rerunning_sync_keeps_one_conflict() {
    let h = Harness::new();
    h.save("a1", json!({"species": "cow", "weight": 40}));
    h.edit_remote_after_local("a1", json!({"species": "cow", "weight": 45}), 5);

    h.sync().await;
    h.sync().await;

    assert_eq!(h.store.conflict_count().unwrap(), 1);
}

#[tokio::test]
async fn network_failure_on_one_item_does_not_stop_the_others() {
    let h = Harness::new();
    for i in 1..=5 {
        h.save(&format!("a{i}"), json!({"species": "cow", "weight": 40 + i}));
    }
    h.remote.set_unreachable(&animals(), &rid("a3"), true);

    let report = h.sync().await;

    assert_eq!(report.pushed, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(report.pending, 1);
    for id in ["a1", "a2", "a4", "a5"] {
        assert!(h.store.get(&animals(), &rid(id)).unwrap().unwrap().synced);
    }
    let pending = h.store.drain().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].record_id, rid("a3"));
    assert_eq!(pending[0].last_failure, Some(FailureKind::Network));
    assert_eq!(pending[0].attempts, 1);

    h.remote.set_unreachable(&animals(), &rid("a3"), false);
    let report = h.sync().await;

    assert_eq!(report.pushed, 1);
    assert_eq!(report.pending, 0);
    assert_eq!(h.remote.len(), 5);
}

#[tokio::test]
async fn offline_writes_arrive_unmodified() {
    let h = Harness::new();
    h.connectivity.set_offline();
    let bodies: Vec<Value> = (0..8)
        .map(|i| json!({"species": "sheep", "weight": i * 7, "tags": ["offline", i]}))
        .collect();
    for (i, body) in bodies.iter().enumerate() {
        h.save(&format!("s{i}"), body.clone());
    }
    assert_eq!(h.orchestrator.sync().await, SyncOutcome::Offline);
    assert_eq!(h.remote.write_count(), 0);

    h.connectivity.set_online();
    h.sync().await;

    for (i, body) in bodies.iter().enumerate() {
        let remote = h.remote.get(&animals(), &rid(&format!("s{i}"))).unwrap();
        assert_eq!(remote.payload, payload(body.clone()));
    }
}

#[tokio::test]
async fn syncing_a_synced_queue_writes_nothing() {
    let h = Harness::new();
    h.save("a1", json!({"weight": 40}));
    h.save("a2", json!({"weight": 41}));
    h.sync().await;
    let writes = h.remote.write_count();

    let report = h.sync().await;

    assert_eq!(report.pushed, 0);
    assert_eq!(h.remote.write_count(), writes);
}

#[tokio::test]
async fn failed_resolution_leaves_conflict_open() {
    let h = Harness::new();
    h.save("a1", json!({"species": "cow", "weight": 40}));
    h.edit_remote_after_local("a1", json!({"species": "cow", "weight": 45}), 5);
    h.sync().await;
    let id = h.orchestrator.open_conflicts().unwrap()[0].id.clone();

    h.remote.set_offline(true);
    let result = h.orchestrator.resolve_one(&id, Decision::Local).await;
    assert!(matches!(result, Err(Error::ResolutionFailed(_))));

    assert_eq!(h.store.conflict_count().unwrap(), 1);
    let stored = h.store.get(&animals(), &rid("a1")).unwrap().unwrap();
    assert!(!stored.synced);
    assert_eq!(stored.payload.get("weight"), Some(&json!(40)));

    h.remote.set_offline(false);
    h.orchestrator.resolve_one(&id, Decision::Local).await.unwrap();
    assert_eq!(h.store.conflict_count().unwrap(), 0);
}

#[tokio::test]
async fn conflicted_record_refuses_local_writes() {
    let h = Harness::new();
    h.save("a1", json!({"species": "cow", "weight": 40}));
    h.edit_remote_after_local("a1", json!({"species": "cow", "weight": 45}), 5);
    h.sync().await;

    let result = h.store.save(&animals(), &rid("a1"), payload(json!({"weight": 50})));
    assert!(matches!(result, Err(Error::ConflictDetected(_))));
}

#[tokio::test]
async fn queue_and_conflicts_survive_restart() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("local.db");
    let remote = Arc::new(MemoryRemote::new());

    {
        let h = Harness::with_store(LocalStore::open(&path).unwrap(), remote.clone());
        h.save("a1", json!({"species": "cow", "weight": 40}));
        h.save("a2", json!({"species": "cow", "weight": 50}));
        h.edit_remote_after_local("a1", json!({"species": "cow", "weight": 45}), 5);
        h.remote.set_unreachable(&animals(), &rid("a2"), true);
        h.sync().await;
        assert!(h.orchestrator.status().last_sync_at.is_some());
    }

    remote.set_unreachable(&animals(), &rid("a2"), false);
    let h = Harness::with_store(LocalStore::open(&path).unwrap(), remote);

    let status = h.orchestrator.status();
    assert_eq!(status.conflicts, 1);
    assert_eq!(status.pending, 2);
    assert!(status.last_sync_at.is_some());

    let report = h.sync().await;
    assert_eq!(report.pushed, 1);
    assert_eq!(report.conflicts, 1);
    assert!(h.store.get(&animals(), &rid("a2")).unwrap().unwrap().synced);
}

#[tokio::test]
async fn trigger_during_run_is_coalesced_into_another_pass() {
    let h = Harness::new();
    h.remote.set_latency(Duration::from_millis(20));
    for i in 1..=3 {
        h.save(&format!("a{i}"), json!({"weight": i}));
    }

    let orchestrator = h.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.sync().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(h.orchestrator.is_running());
    assert_eq!(h.orchestrator.sync().await, SyncOutcome::Coalesced);
    h.save("a4", json!({"weight": 4}));

    let report = match first.await.unwrap() {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected a completed run, got {other:?}"),
    };
    assert_eq!(report.passes, 2);
    assert_eq!(report.pushed, 4);
    assert_eq!(report.pending, 0);
}

#[tokio::test]
async fn cancellation_stops_before_the_next_change() {
    let h = Harness::new();
    h.remote.set_latency(Duration::from_millis(25));
    for i in 1..=5 {
        h.save(&format!("a{i}"), json!({"weight": i}));
    }

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.sync().await });
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.orchestrator.cancel();

    let report = match run.await.unwrap() {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected a completed run, got {other:?}"),
    };
    assert!(report.cancelled);
    assert!(report.pushed >= 1 && report.pushed < 5);
    assert_eq!(report.pending, 5 - report.pushed);
    // Every change either fully pushed or untouched.
    assert_eq!(h.remote.len(), report.pushed);

    h.remote.set_latency(Duration::ZERO);
    let report = h.sync().await;
    assert!(!report.cancelled);
    assert_eq!(report.pending, 0);
}

#[tokio::test]
async fn rejected_change_waits_for_a_fix() {
    let h = Harness::new();
    h.save("a1", json!({"species": "cow", "weight": -1}));
    h.remote.reject(&animals(), &rid("a1"), true);

    let report = h.sync().await;
    assert_eq!(report.rejected, 1);

    // Not retried automatically, even once the remote would accept it.
    h.remote.reject(&animals(), &rid("a1"), false);
    let report = h.sync().await;
    assert_eq!(report.pushed, 0);
    assert_eq!(report.rejected, 0);
    assert_eq!(report.pending, 1);
    assert_eq!(h.remote.write_count(), 0);

    // A corrected write supersedes the rejected one.
    h.save("a1", json!({"species": "cow", "weight": 41}));
    let report = h.sync().await;
    assert_eq!(report.pushed, 1);
    assert_eq!(report.pending, 0);
    assert_eq!(
        h.remote.get(&animals(), &rid("a1")).unwrap().payload.get("weight"),
        Some(&json!(41))
    );
}

#[tokio::test]
async fn unauthorized_aborts_into_error_and_next_trigger_retries() {
    let h = Harness::new();
    h.save("a1", json!({"weight": 40}));
    h.save("a2", json!({"weight": 41}));
    h.remote.set_unauthorized(true);

    match h.orchestrator.sync().await {
        SyncOutcome::Failed { report, error } => {
            assert!(error.contains("Unauthorized"));
            assert_eq!(report.pushed, 0);
            assert_eq!(report.pending, 2);
        }
        other => panic!("expected a failed run, got {other:?}"),
    }
    let status = h.orchestrator.status();
    assert_eq!(status.state, SyncState::Error);
    assert!(status.last_error.is_some());
    assert_eq!(h.store.load_status().unwrap().last_state.as_deref(), Some("error"));
    assert_eq!(h.store.pending_count().unwrap(), 2);

    h.remote.set_unauthorized(false);
    let report = h.sync().await;

    assert_eq!(report.pushed, 2);
    let status = h.orchestrator.status();
    assert_eq!(status.state, SyncState::Idle);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn deletes_made_offline_reach_the_remote() {
    let h = Harness::new();
    h.save("a1", json!({"weight": 40}));
    h.sync().await;

    h.connectivity.set_offline();
    h.store.remove(&animals(), &rid("a1")).unwrap();
    assert!(!h.connectivity.current().is_online());

    h.connectivity.set_online();
    let report = h.sync().await;

    assert_eq!(report.pushed, 1);
    assert!(h.remote.get(&animals(), &rid("a1")).is_none());
}
