//! Sync scheduling: manual requests, periodic runs and connectivity triggers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::{interval, sleep_until, Instant, Interval};
use tracing::{debug, info};

use driftwood_common::{Error, Result};

use crate::connectivity::Connectivity;
use crate::engine::SyncOrchestrator;
use crate::state::SyncOutcome;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Runs happen on request and when connectivity returns.
    Manual,
    /// Additionally sync at regular intervals.
    Periodic {
        #[serde(with = "crate::config::millis")]
        interval: Duration,
    },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }
}

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    Sync,
    Shutdown,
}

type Request = (SyncRequest, oneshot::Sender<SyncOutcome>);

/// Front end for requesting syncs from a running scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<Request>,
}

impl SyncScheduler {
    /// Create a scheduler for `orchestrator`, configured from its config.
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(orchestrator.config().sync_mode.clone()));
        let debounce = orchestrator.config().connectivity_debounce;
        let connectivity = orchestrator.connectivity().subscribe();

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };

        let handle = SyncSchedulerHandle {
            orchestrator,
            mode,
            request_rx,
            connectivity: Some(connectivity),
            debounce,
        };

        (scheduler, handle)
    }

    /// Request a sync and wait for its outcome.
    pub async fn request_sync(&self) -> Result<SyncOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Sync, response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Sync run dropped its result".to_string()))
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the scheduler; an active run stops before its next change.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Background half of the scheduler.
pub struct SyncSchedulerHandle {
    orchestrator: Arc<SyncOrchestrator>,
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<Request>,
    connectivity: Option<watch::Receiver<Connectivity>>,
    debounce: Duration,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop. Spawn this on a tokio task.
    ///
    /// Every trigger spawns an orchestrator run, so a trigger that lands
    /// during a run is coalesced by the orchestrator rather than queued here.
    pub async fn run(mut self) {
        let mut current_interval = self.mode.read().await.interval();
        let mut periodic = current_interval.map(interval);
        let mut online_since: Option<Instant> = None;
        let mut last_seen = self
            .connectivity
            .as_mut()
            .map(|rx| *rx.borrow_and_update())
            .unwrap_or(Connectivity::Offline);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((SyncRequest::Sync, response_tx)) => {
                            debug!("Manual sync requested");
                            let orchestrator = self.orchestrator.clone();
                            tokio::spawn(async move {
                                let _ = response_tx.send(orchestrator.sync().await);
                            });
                        }
                        Some((SyncRequest::Shutdown, _)) | None => {
                            info!("Sync scheduler shutting down");
                            self.orchestrator.cancel();
                            break;
                        }
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    debug!("Triggering periodic sync");
                    self.spawn_sync();
                }

                changed = Self::next_connectivity(&mut self.connectivity) => {
                    match changed {
                        Some(Connectivity::Online) if last_seen != Connectivity::Online => {
                            debug!("Back online; waiting {:?} before syncing", self.debounce);
                            last_seen = Connectivity::Online;
                            online_since = Some(Instant::now() + self.debounce);
                        }
                        Some(Connectivity::Offline) => {
                            last_seen = Connectivity::Offline;
                            online_since = None;
                        }
                        Some(_) => {}
                        None => {
                            debug!("Connectivity monitor dropped");
                            self.connectivity = None;
                        }
                    }
                }

                _ = Self::wait_for_debounce(online_since) => {
                    online_since = None;
                    info!("Connectivity regained; syncing");
                    self.spawn_sync();
                }
            }

            let expected = self.mode.read().await.interval();
            if expected != current_interval {
                current_interval = expected;
                periodic = expected.map(interval);
            }
        }
    }

    fn spawn_sync(&self) {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.sync().await;
        });
    }

    async fn wait_for_periodic(periodic: &mut Option<Interval>) {
        match periodic {
            Some(periodic) => {
                periodic.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    async fn wait_for_debounce(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    async fn next_connectivity(
        rx: &mut Option<watch::Receiver<Connectivity>>,
    ) -> Option<Connectivity> {
        match rx {
            Some(rx) => match rx.changed().await {
                Ok(()) => Some(*rx.borrow_and_update()),
                Err(_) => None,
            },
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::connectivity::ManualConnectivity;
    use crate::state::{SyncEvent, SyncState};
    use driftwood_remote::MemoryRemote;
    use driftwood_store::LocalStore;

    fn orchestrator(
        connectivity: Arc<ManualConnectivity>,
        config: SyncConfig,
    ) -> Arc<SyncOrchestrator> {
        Arc::new(
            SyncOrchestrator::new(
                Arc::new(LocalStore::in_memory().unwrap()),
                Arc::new(MemoryRemote::new()),
                connectivity,
                config,
            )
            .unwrap(),
        )
    }

    fn count_runs(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> usize {
        let mut runs = 0;
        while let Ok(event) = events.try_recv() {
            if event == SyncEvent::StateChanged(SyncState::Syncing) {
                runs += 1;
            }
        }
        runs
    }

    #[tokio::test]
    async fn test_mode_change() {
        let orchestrator = orchestrator(Arc::new(ManualConnectivity::online()), SyncConfig::default());
        let (scheduler, _handle) = SyncScheduler::new(orchestrator);
        assert_eq!(scheduler.get_mode().await, SyncMode::Manual);

        scheduler
            .set_mode(SyncMode::Periodic {
                interval: Duration::from_secs(60),
            })
            .await;
        assert!(matches!(scheduler.get_mode().await, SyncMode::Periodic { .. }));
    }

    #[tokio::test]
    async fn test_sync_request() {
        let orchestrator = orchestrator(Arc::new(ManualConnectivity::online()), SyncConfig::default());
        let (scheduler, handle) = SyncScheduler::new(orchestrator);
        let task = tokio::spawn(handle.run());

        let outcome = scheduler.request_sync().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(_)));

        scheduler.shutdown().await;
        task.await.unwrap();
        assert!(scheduler.request_sync().await.is_err());
    }

    #[tokio::test]
    async fn test_flapping_connectivity_triggers_one_run() {
        let connectivity = Arc::new(ManualConnectivity::offline());
        let orchestrator = orchestrator(
            connectivity.clone(),
            SyncConfig {
                connectivity_debounce: Duration::from_millis(50),
                ..SyncConfig::default()
            },
        );
        let mut events = orchestrator.events();
        let (scheduler, handle) = SyncScheduler::new(orchestrator);
        let task = tokio::spawn(handle.run());

        for _ in 0..3 {
            connectivity.set_online();
            tokio::time::sleep(Duration::from_millis(5)).await;
            connectivity.set_offline();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        connectivity.set_online();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(count_runs(&mut events), 1);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_mode_runs_repeatedly() {
        let orchestrator = orchestrator(
            Arc::new(ManualConnectivity::online()),
            SyncConfig {
                sync_mode: SyncMode::Periodic {
                    interval: Duration::from_millis(30),
                },
                ..SyncConfig::default()
            },
        );
        let mut events = orchestrator.events();
        let (scheduler, handle) = SyncScheduler::new(orchestrator);
        let task = tokio::spawn(handle.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown().await;
        task.await.unwrap();

        assert!(count_runs(&mut events) >= 2);
    }
}
