//! Sync state, status snapshots and run reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use driftwood_common::{ChangeAction, CollectionName, ConflictId, Error, RecordId, Result};
use driftwood_store::FailureKind;

/// Orchestrator state machine: `Idle -> Syncing -> {Idle, Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    /// The last run aborted; the next trigger may start a new one.
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(SyncState::Idle),
            "syncing" => Ok(SyncState::Syncing),
            "error" => Ok(SyncState::Error),
            other => Err(Error::InvalidInput(format!("Unknown sync state: {}", other))),
        }
    }
}

/// Observable snapshot of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    /// Unacknowledged queue items.
    pub pending: usize,
    /// Open conflicts.
    pub conflicts: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub fn idle() -> Self {
        Self {
            state: SyncState::Idle,
            pending: 0,
            conflicts: 0,
            last_sync_at: None,
            last_error: None,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// What one orchestrator run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Changes written to (or deleted from) the remote.
    pub pushed: usize,
    /// Changes that failed with a network error and stay queued.
    pub failed: usize,
    /// Changes the remote refused; not retried automatically.
    pub rejected: usize,
    /// Changes skipped because the remote holds a newer version.
    pub mismatched: usize,
    pub conflicts_found: usize,
    /// Mismatched records whose payloads turned out equal.
    pub converged: usize,
    pub auto_resolved: usize,
    pub passes: u32,
    pub cancelled: bool,
    /// Queue items still pending at the end of the run.
    pub pending: usize,
    /// Conflicts open at the end of the run.
    pub conflicts: usize,
    pub duration: Duration,
}

impl SyncReport {
    /// Fold an earlier run into this one. Counters and time add up; the
    /// end-of-run fields stay this run's.
    pub fn absorb(&mut self, earlier: &SyncReport) {
        self.pushed += earlier.pushed;
        self.failed += earlier.failed;
        self.rejected += earlier.rejected;
        self.mismatched += earlier.mismatched;
        self.conflicts_found += earlier.conflicts_found;
        self.converged += earlier.converged;
        self.auto_resolved += earlier.auto_resolved;
        self.passes += earlier.passes;
        self.duration += earlier.duration;
    }
}

/// Result of asking the orchestrator to sync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// A run happened and finished.
    Completed(SyncReport),
    /// A run started but aborted (unauthorized, storage outage).
    Failed { report: SyncReport, error: String },
    /// Another run was active; it will make one more pass.
    Coalesced,
    /// No connectivity; nothing was attempted.
    Offline,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) | SyncOutcome::Failed { report, .. } => Some(report),
            SyncOutcome::Coalesced | SyncOutcome::Offline => None,
        }
    }

    /// This outcome with an earlier run's report folded in.
    pub(crate) fn after(self, earlier: SyncReport) -> SyncOutcome {
        match self {
            SyncOutcome::Completed(mut report) => {
                report.absorb(&earlier);
                SyncOutcome::Completed(report)
            }
            SyncOutcome::Failed { mut report, error } => {
                report.absorb(&earlier);
                SyncOutcome::Failed { report, error }
            }
            SyncOutcome::Coalesced | SyncOutcome::Offline => SyncOutcome::Completed(earlier),
        }
    }
}

/// Notifications published while the engine works.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    ChangeFailed {
        change_id: String,
        collection: CollectionName,
        record_id: RecordId,
        action: ChangeAction,
        kind: FailureKind,
        message: String,
    },
    ConflictDetected(ConflictId),
    ConflictResolved(ConflictId),
}
