//! Explicit store registry.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::ConfigError;
use crate::store::{Store, StoreBuilder};

/// Stores keyed by name, owned by whoever constructs the registry.
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: DashMap<String, Arc<Store>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register a store under its configured name.
    pub fn create(&self, builder: StoreBuilder) -> Result<Arc<Store>, ConfigError> {
        let name = builder.config().name.clone();
        match self.stores.entry(name.clone()) {
            Entry::Occupied(_) => Err(ConfigError::DuplicateStore { name }),
            Entry::Vacant(entry) => {
                let store = builder.build()?;
                entry.insert(Arc::clone(&store));
                debug!(store = %name, "store registered");
                Ok(store)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Store>> {
        self.stores.get(name).map(|store| Arc::clone(&store))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Clear and unregister a store. Returns whether it was registered.
    pub fn dispose(&self, name: &str) -> bool {
        match self.stores.remove(name) {
            Some((_, store)) => {
                store.clear_all();
                debug!(store = %name, "store disposed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use serde_json::json;

    #[test]
    fn test_lifecycle() {
        let registry = StoreRegistry::new();
        let users = registry
            .create(StoreBuilder::new(StoreConfig::named("users")))
            .unwrap();
        registry
            .create(StoreBuilder::new(StoreConfig::named("posts")))
            .unwrap();
        assert_eq!(registry.names(), vec!["posts", "users"]);

        let record = json!({"id": 1}).as_object().cloned().unwrap();
        users.add_or_update(record).unwrap();
        assert!(Arc::ptr_eq(&registry.get("users").unwrap(), &users));

        assert!(registry.dispose("users"));
        assert!(users.items().is_empty());
        assert!(registry.get("users").is_none());
        assert!(!registry.dispose("users"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_name() {
        let registry = StoreRegistry::new();
        registry
            .create(StoreBuilder::new(StoreConfig::named("a")))
            .unwrap();
        let err = registry
            .create(StoreBuilder::new(StoreConfig::named("a")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStore { name } if name == "a"));
    }
}
