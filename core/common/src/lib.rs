//! Common utilities and types shared across the Driftwood crates.
//!
//! This module provides the identifiers, record shapes and the error taxonomy
//! used by the local store, the remote adapters and the sync engine.

pub mod error;
pub mod record;
pub mod types;

pub use error::{Error, Result};
pub use record::{now_micros, payload_from_str, Payload, Record, RemoteRecord};
pub use types::{ChangeAction, CollectionName, ConflictId, RecordId};
