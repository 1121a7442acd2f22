//! Connectivity monitoring.
//!
//! The engine never reads a global "online" flag. It is handed a
//! `ConnectivityMonitor` and reacts to its transitions.

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use driftwood_remote::RemoteStore;

/// Whether the remote store is believed reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    WentOnline,
    WentOffline,
}

/// Source of connectivity state.
pub trait ConnectivityMonitor: Send + Sync {
    /// Current state.
    fn current(&self) -> Connectivity;

    /// Receiver that observes every state change.
    fn subscribe(&self) -> watch::Receiver<Connectivity>;
}

/// Turn a monitor's state changes into a stream of transitions.
///
/// Repeated reports of the same state are dropped; the stream ends when the
/// monitor is dropped.
pub fn events(monitor: &dyn ConnectivityMonitor) -> impl Stream<Item = ConnectivityEvent> + Send {
    let mut rx = monitor.subscribe();
    let initial = *rx.borrow_and_update();

    stream::unfold((rx, initial), |(mut rx, mut last)| async move {
        loop {
            if rx.changed().await.is_err() {
                return None;
            }
            let now = *rx.borrow_and_update();
            if now != last {
                last = now;
                let event = match now {
                    Connectivity::Online => ConnectivityEvent::WentOnline,
                    Connectivity::Offline => ConnectivityEvent::WentOffline,
                };
                return Some((event, (rx, last)));
            }
        }
    })
}

/// Connectivity set explicitly by the embedding application.
pub struct ManualConnectivity {
    tx: watch::Sender<Connectivity>,
}

impl ManualConnectivity {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn online() -> Self {
        Self::new(Connectivity::Online)
    }

    pub fn offline() -> Self {
        Self::new(Connectivity::Offline)
    }

    /// Publish a state; repeating the current state is a no-op.
    pub fn set(&self, next: Connectivity) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!("Connectivity changed: {:?}", next);
        }
    }

    pub fn set_online(&self) {
        self.set(Connectivity::Online);
    }

    pub fn set_offline(&self) {
        self.set(Connectivity::Offline);
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

/// Connectivity derived from a periodic async probe.
///
/// Starts `Offline`; the first probe runs immediately. The background task
/// stops when the monitor is dropped.
pub struct ProbeConnectivity {
    tx: Arc<watch::Sender<Connectivity>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProbeConnectivity {
    /// Spawn a probe loop running `probe` every `interval`.
    pub fn spawn<F, Fut>(probe: F, interval: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let (tx, _rx) = watch::channel(Connectivity::Offline);
        let tx = Arc::new(tx);
        let cancel = CancellationToken::new();

        let task_tx = tx.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let next = if probe().await {
                            Connectivity::Online
                        } else {
                            Connectivity::Offline
                        };
                        task_tx.send_if_modified(|current| {
                            if *current == next {
                                false
                            } else {
                                debug!("Probe reports {:?}", next);
                                *current = next;
                                true
                            }
                        });
                    }
                }
            }
        });

        Self { tx, cancel, task }
    }

    /// Probe a remote store with `ping`, each attempt bounded by `timeout`.
    pub fn for_remote(remote: Arc<dyn RemoteStore>, interval: Duration, timeout: Duration) -> Self {
        Self::spawn(
            move || {
                let remote = remote.clone();
                async move {
                    matches!(tokio::time::timeout(timeout, remote.ping()).await, Ok(Ok(())))
                }
            },
            interval,
        )
    }

    /// Whether the probe task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl ConnectivityMonitor for ProbeConnectivity {
    fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

impl Drop for ProbeConnectivity {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
