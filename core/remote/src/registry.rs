//! Remote registry for resolving adapters by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use driftwood_common::{Error, Result};

use crate::memory::MemoryRemote;
use crate::provider::RemoteStore;
use crate::sqlite::SqliteRemote;

/// Factory function type for creating remotes.
pub type RemoteFactory = Box<dyn Fn(Value) -> Result<Arc<dyn RemoteStore>> + Send + Sync>;

/// Registry for remote store factories.
pub struct RemoteRegistry {
    factories: HashMap<String, RemoteFactory>,
}

impl RemoteRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a remote factory.
    ///
    /// # Errors
    /// - `InvalidInput` if the name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: RemoteFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Remote '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a remote by name and configuration.
    ///
    /// # Errors
    /// - `NotFound` if no factory is registered under `name`
    /// - whatever the factory reports for an invalid configuration
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn RemoteStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Remote '{}' is not registered", name)))?;
        factory(config)
    }

    /// Registered remote names, sorted.
    pub fn remotes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a remote is registered.
    pub fn has_remote(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in remotes.
pub fn create_default_registry() -> RemoteRegistry {
    let mut registry = RemoteRegistry::new();

    registry.factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(MemoryRemote::new()))),
    );

    registry.factories.insert(
        "sqlite".to_string(),
        Box::new(|config| {
            let path = config
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::InvalidInput("sqlite remote requires a 'path'".to_string())
                })?;
            Ok(Arc::new(SqliteRemote::open(path)?))
        }),
    );

    registry
}
