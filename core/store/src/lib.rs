//! Driftwood local store.
//!
//! An embedded SQLite database holding:
//! - typed record collections, each row carrying a sync flag and timestamps
//! - the pending change queue of not-yet-acknowledged mutations
//! - open conflicts, so they survive restarts
//! - the persisted sync status (last sync time, last error)
//!
//! Every operation runs in its own transaction; a failed operation leaves the
//! store unchanged.

pub mod conflicts;
pub mod queue;
pub mod records;
mod schema;
pub mod status;
mod store;

pub use conflicts::{new_conflict, Conflict};
pub use queue::{FailureKind, PendingChange};
pub use status::SyncStatusRecord;
pub use store::LocalStore;
