//! Remote store abstraction for Driftwood.
//!
//! The canonical data lives in a remote keyed CRUD store. This crate defines
//! the collaborator trait the sync engine talks to, plus the adapters that
//! ship with it:
//! - `MemoryRemote`: in-process store with fault injection, for tests
//! - `SqliteRemote`: a SQLite file acting as the remote, for the CLI
//!
//! Adapters are resolved by name through a `RemoteRegistry`.

pub mod memory;
pub mod provider;
pub mod registry;
pub mod sqlite;

pub use memory::MemoryRemote;
pub use provider::RemoteStore;
pub use registry::{create_default_registry, RemoteFactory, RemoteRegistry};
pub use sqlite::SqliteRemote;
