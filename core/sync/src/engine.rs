//! Sync orchestrator: pushes the pending queue, detects conflicts and
//! publishes status.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use driftwood_common::{
    now_micros, ChangeAction, CollectionName, ConflictId, Error, Record, RecordId, Result,
};
use driftwood_remote::RemoteStore;
use driftwood_store::{Conflict, FailureKind, LocalStore, PendingChange, SyncStatusRecord};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::detector::{ConflictDetector, Detection};
use crate::resolver::{ConflictResolver, Decision, ResolveAllReport};
use crate::retry::RetryExecutor;
use crate::state::{SyncEvent, SyncOutcome, SyncReport, SyncState, SyncStatus};

const EVENT_CAPACITY: usize = 256;

/// Coordinates sync runs between the local store and the remote store.
///
/// At most one run is active at a time. A trigger that arrives during a run
/// returns `SyncOutcome::Coalesced` and makes the active run take one more
/// pass before it finishes.
pub struct SyncOrchestrator {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    retry: RetryExecutor,
    config: SyncConfig,
    running: AtomicBool,
    rerun: AtomicBool,
    cancel: Mutex<CancellationToken>,
    status_tx: watch::Sender<SyncStatus>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl SyncOrchestrator {
    /// Create an orchestrator, restoring the persisted status.
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let persisted = store.load_status()?;
        let state = match persisted.last_state.as_deref() {
            Some("error") => SyncState::Error,
            _ => SyncState::Idle,
        };
        let status = SyncStatus {
            state,
            pending: store.pending_count()?,
            conflicts: store.conflict_count()?,
            last_sync_at: persisted.last_sync_at,
            last_error: persisted.last_error,
        };
        let (status_tx, _) = watch::channel(status);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let resolver = ConflictResolver::new(
            store.clone(),
            remote.clone(),
            RetryExecutor::new(config.retry_config()),
        );

        Ok(Self {
            detector: ConflictDetector::new(config.ignored_fields.clone()),
            retry: RetryExecutor::new(config.retry_config()),
            store,
            remote,
            connectivity,
            resolver,
            config,
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            status_tx,
            events_tx,
        })
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn connectivity(&self) -> &Arc<dyn ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    /// Observe status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Observe engine events.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    /// Whether a run is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the active run to stop before its next change.
    pub fn cancel(&self) {
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
    }

    /// Open conflicts, oldest local version first.
    pub fn open_conflicts(&self) -> Result<Vec<Conflict>> {
        self.store.list_conflicts()
    }

    /// Resolve one conflict and publish the result.
    pub async fn resolve_one(&self, id: &ConflictId, decision: Decision) -> Result<Record> {
        let record = self.resolver.resolve_one(id, decision).await?;
        self.emit(SyncEvent::ConflictResolved(id.clone()));
        self.refresh_counts();
        Ok(record)
    }

    /// Resolve every open conflict with one decision.
    pub async fn resolve_all(&self, decision: &Decision) -> Result<ResolveAllReport> {
        let report = self.resolver.resolve_all(decision).await?;
        for id in &report.resolved {
            self.emit(SyncEvent::ConflictResolved(id.clone()));
        }
        self.refresh_counts();
        Ok(report)
    }

    /// Run a sync.
    ///
    /// Never fails: errors end up in the returned outcome and in the
    /// published status, and unsynced data is kept. A trigger that is
    /// coalesced after the run's last check gets a follow-up run, and the
    /// returned report covers both.
    pub async fn sync(&self) -> SyncOutcome {
        if !self.connectivity.current().is_online() {
            debug!("Sync skipped: offline");
            return SyncOutcome::Offline;
        }

        if !self.try_begin() {
            debug!("Sync already running; coalescing trigger");
            self.rerun.store(true, Ordering::SeqCst);
            return SyncOutcome::Coalesced;
        }

        let mut outcome = self.guarded_run().await;
        loop {
            let earlier = match &outcome {
                SyncOutcome::Completed(report) if !report.cancelled => report.clone(),
                _ => break,
            };
            if !self.rerun.swap(false, Ordering::SeqCst) {
                break;
            }
            if !self.connectivity.current().is_online() {
                debug!("Coalesced trigger dropped: offline");
                break;
            }
            if !self.try_begin() {
                // Another caller started a run and will pick the work up.
                break;
            }
            debug!("Trigger arrived as the run finished; running again");
            outcome = self.guarded_run().await.after(earlier);
        }
        outcome
    }

    fn try_begin(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Run with the guard held; `running` is released even if the future
    /// is dropped mid-run.
    async fn guarded_run(&self) -> SyncOutcome {
        let mut guard = RunGuard {
            orchestrator: self,
            finished: false,
        };
        let token = self.fresh_token();
        let outcome = self.run(&token).await;
        guard.finished = true;
        outcome
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.cancel.lock() {
            *current = token.clone();
        }
        token
    }

    async fn run(&self, token: &CancellationToken) -> SyncOutcome {
        let start = Instant::now();
        let mut report = SyncReport::default();

        info!("Starting sync with {}", self.remote.name());
        self.set_state(SyncState::Syncing, None);

        let mut result = Ok(());
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            let position = match self.store.last_queue_position() {
                Ok(position) => position,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };

            report.passes += 1;
            if let Err(err) = self.run_pass(&mut report, token).await {
                result = Err(err);
                break;
            }

            if report.cancelled {
                break;
            }
            if report.passes >= self.config.max_passes {
                if self.rerun.load(Ordering::SeqCst) {
                    debug!("Reached {} passes; deferring coalesced trigger", report.passes);
                }
                break;
            }
            if !self.connectivity.current().is_online() {
                debug!("Connectivity lost; ending run");
                break;
            }
            let grew = self
                .store
                .last_queue_position()
                .map(|now| now > position)
                .unwrap_or(false);
            if !grew && !self.rerun.load(Ordering::SeqCst) {
                break;
            }
            debug!("New work arrived during pass {}; running again", report.passes);
        }

        report.pending = self.store.pending_count().unwrap_or(0);
        report.conflicts = self.store.conflict_count().unwrap_or(0);
        report.duration = start.elapsed();

        match result {
            Ok(()) => {
                self.finish(SyncState::Idle, None);
                self.prune();
                info!(
                    "Sync completed: {} pushed, {} failed, {} rejected, {} conflicts found, {} pending",
                    report.pushed,
                    report.failed,
                    report.rejected,
                    report.conflicts_found,
                    report.pending
                );
                SyncOutcome::Completed(report)
            }
            Err(err) => {
                let message = err.to_string();
                error!("Sync aborted: {}", message);
                self.finish(SyncState::Error, Some(message.clone()));
                SyncOutcome::Failed {
                    report,
                    error: message,
                }
            }
        }
    }

    /// One pass: push the queue, classify mismatches, apply the policy.
    ///
    /// Only errors that make the rest of the run pointless are returned.
    async fn run_pass(&self, report: &mut SyncReport, token: &CancellationToken) -> Result<()> {
        let changes = self.store.drain()?;
        debug!("Pass {}: {} queued change(s)", report.passes, changes.len());

        let mut mismatched: BTreeMap<CollectionName, BTreeSet<RecordId>> = BTreeMap::new();

        for change in changes {
            if token.is_cancelled() {
                info!("Sync cancelled; remaining changes stay queued");
                report.cancelled = true;
                return Ok(());
            }
            if change.is_rejected() {
                continue;
            }
            if self.store.has_conflict(&change.collection, &change.record_id)? {
                continue;
            }
            // Superseded by a later change acknowledged since the drain.
            if self
                .store
                .get_change(&change.id)?
                .map_or(true, |current| current.synced)
            {
                continue;
            }

            match self.push(&change).await {
                Ok(server_timestamp) => {
                    self.store.ack_and_mark_synced(&change, server_timestamp)?;
                    report.pushed += 1;
                    debug!(
                        "Pushed {} {}/{}",
                        change.action, change.collection, change.record_id
                    );
                }
                Err(err) if err.is_fatal_for_sync() => return Err(err),
                Err(Error::VersionMismatch(message)) => {
                    self.fail_change(&change, FailureKind::VersionMismatch, &message)?;
                    report.mismatched += 1;
                    mismatched
                        .entry(change.collection.clone())
                        .or_default()
                        .insert(change.record_id.clone());
                }
                Err(err @ (Error::RemoteRejected(_) | Error::InvalidInput(_))) => {
                    self.fail_change(&change, FailureKind::Rejected, &err.to_string())?;
                    report.rejected += 1;
                }
                Err(err) => {
                    self.fail_change(&change, FailureKind::Network, &err.to_string())?;
                    report.failed += 1;
                }
            }
        }
        self.refresh_counts();

        self.detect_conflicts(&mismatched, report).await?;

        if let Some(decision) = self.config.conflict_policy.decision() {
            self.auto_resolve(decision, report).await?;
        }

        self.refresh_counts();
        Ok(())
    }

    /// Push one change. Returns the server timestamp of the written version.
    async fn push(&self, change: &PendingChange) -> Result<Option<DateTime<Utc>>> {
        let collection = &change.collection;
        let id = &change.record_id;

        if change.action == ChangeAction::Delete {
            self.call(|| self.remote.delete(collection, id)).await?;
            return Ok(None);
        }

        let payload = change.payload.clone().ok_or_else(|| {
            Error::InvalidInput(format!("{} change {} has no payload", change.action, change.id))
        })?;

        let current = self.call(|| self.remote.fetch_by_id(collection, id)).await?;
        if let Some(current) = current {
            let base = self
                .store
                .get(collection, id)?
                .and_then(|record| record.server_timestamp);
            let known = base.map_or(change.timestamp, |base| base.max(change.timestamp));
            if current.modified > known {
                return Err(Error::VersionMismatch(format!(
                    "{}/{} was modified remotely at {}",
                    collection, id, current.modified
                )));
            }
        }

        let stored = self
            .call(|| self.remote.upsert(collection, id, payload.clone()))
            .await?;
        Ok(Some(stored.modified))
    }

    async fn detect_conflicts(
        &self,
        mismatched: &BTreeMap<CollectionName, BTreeSet<RecordId>>,
        report: &mut SyncReport,
    ) -> Result<()> {
        for (collection, ids) in mismatched {
            let candidates: Vec<Record> = self
                .store
                .get_all_unsynced(collection)?
                .into_iter()
                .filter(|record| ids.contains(&record.id))
                .collect();

            for record in candidates {
                let detection = self
                    .call(|| self.detector.detect(self.remote.as_ref(), &record))
                    .await;

                match detection {
                    Ok(Detection::Conflict(conflict)) => {
                        self.store.open_conflict(&conflict)?;
                        report.conflicts_found += 1;
                        warn!(
                            "Conflict on {}: fields {:?} differ",
                            conflict.id, conflict.fields
                        );
                        self.emit(SyncEvent::ConflictDetected(conflict.id));
                    }
                    Ok(Detection::Converged(remote)) => {
                        self.store
                            .mark_converged(collection, &record.id, remote.modified)?;
                        report.converged += 1;
                    }
                    Ok(Detection::NoRemote) => {
                        debug!(
                            "{}/{} vanished remotely; it will be pushed next run",
                            collection, record.id
                        );
                    }
                    Ok(Detection::LocalNewer) => {
                        debug!("{}/{} is newer locally", collection, record.id);
                    }
                    Err(err) if err.is_fatal_for_sync() => return Err(err),
                    Err(err) => {
                        warn!(
                            "Conflict check for {}/{} failed: {}",
                            collection, record.id, err
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn auto_resolve(&self, decision: Decision, report: &mut SyncReport) -> Result<()> {
        for conflict in self.store.list_conflicts()? {
            match self.resolver.resolve_one(&conflict.id, decision.clone()).await {
                Ok(_) => {
                    report.auto_resolved += 1;
                    self.emit(SyncEvent::ConflictResolved(conflict.id));
                }
                Err(err) => {
                    warn!("Automatic resolution of {} failed: {}", conflict.id, err);
                }
            }
        }
        Ok(())
    }

    /// Run a remote call bounded by the request timeout, retrying
    /// transient failures.
    async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry.execute(operation).await
    }

    fn fail_change(&self, change: &PendingChange, kind: FailureKind, message: &str) -> Result<()> {
        warn!(
            "{} {}/{} failed ({}): {}",
            change.action, change.collection, change.record_id, kind, message
        );
        self.store.record_failure(&change.id, kind, message)?;
        self.emit(SyncEvent::ChangeFailed {
            change_id: change.id.clone(),
            collection: change.collection.clone(),
            record_id: change.record_id.clone(),
            action: change.action,
            kind,
            message: message.to_string(),
        });
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    fn set_state(&self, state: SyncState, last_error: Option<String>) {
        let mut changed = false;
        self.status_tx.send_modify(|status| {
            changed = status.state != state;
            status.state = state;
            if state != SyncState::Syncing {
                status.last_error = last_error;
            }
        });
        if changed {
            self.emit(SyncEvent::StateChanged(state));
        }
    }

    fn refresh_counts(&self) {
        let pending = self.store.pending_count();
        let conflicts = self.store.conflict_count();
        self.status_tx.send_modify(|status| {
            if let Ok(pending) = pending {
                status.pending = pending;
            }
            if let Ok(conflicts) = conflicts {
                status.conflicts = conflicts;
            }
        });
    }

    fn finish(&self, state: SyncState, last_error: Option<String>) {
        let previous = self.status();
        let last_sync_at = match state {
            SyncState::Idle => Some(now_micros()),
            _ => previous.last_sync_at,
        };

        self.status_tx.send_modify(|status| status.last_sync_at = last_sync_at);
        self.publish_end(state, last_sync_at, last_error);
    }

    /// Leave `Syncing` after a run that never reached its end. The last
    /// sync time and error stay as they were.
    fn abandon(&self) {
        let previous = self.status();
        self.publish_end(SyncState::Idle, previous.last_sync_at, previous.last_error);
    }

    fn publish_end(
        &self,
        state: SyncState,
        last_sync_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
    ) {
        self.refresh_counts();
        self.set_state(state, last_error.clone());

        let record = SyncStatusRecord {
            last_sync_at,
            last_error,
            last_state: Some(state.as_str().to_string()),
        };
        if let Err(err) = self.store.save_status(&record) {
            warn!("Failed to persist sync status: {}", err);
        }
    }

    fn prune(&self) {
        if let Some(retention) = self.config.retention {
            if let Err(err) = self.store.prune_expired(retention) {
                warn!("Pruning the queue failed: {}", err);
            }
        }
    }
}

/// Holds the single-run flag for one run.
struct RunGuard<'a> {
    orchestrator: &'a SyncOrchestrator,
    finished: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Sync run dropped before finishing; remaining changes stay queued");
            self.orchestrator.abandon();
        }
        self.orchestrator.running.store(false, Ordering::SeqCst);
    }
}
