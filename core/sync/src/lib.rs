//! Driftwood sync engine
//!
//! Reconciles a local-first store with a remote canonical store:
//! - Sync orchestrator with a single-run guard, coalescing and cancellation
//! - Connectivity monitoring with debounced reconnect triggers
//! - Conflict detection by timestamp and field diff
//! - Conflict resolution (local, server, merge) and automatic policies
//! - Retry strategy with exponential backoff
//! - Manual and periodic scheduling

pub mod config;
pub mod connectivity;
pub mod detector;
pub mod engine;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use config::SyncConfig;
pub use connectivity::{
    events, Connectivity, ConnectivityEvent, ConnectivityMonitor, ManualConnectivity,
    ProbeConnectivity,
};
pub use detector::{diff_fields, ConflictDetector, Detection, DEFAULT_IGNORED_FIELDS};
pub use engine::SyncOrchestrator;
pub use resolver::{ConflictPolicy, ConflictResolver, Decision, FieldMerge, ResolveAllReport};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{SyncEvent, SyncOutcome, SyncReport, SyncState, SyncStatus};
