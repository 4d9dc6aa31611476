//! Clone registry: editable copies of canonical records.
//!
//! A clone is keyed by the same identity as its origin. Edits to a clone stay
//! local until [`CloneRegistry::commit`] writes them back.

use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use crate::error::{Result, StoreError};
use crate::identity::Identity;
use crate::model::Model;
use crate::storage::{KeySource, StorageMap, Tier};
use crate::temps::Canonical;
use crate::types::{CLONE_FLAG, Record, is_clone};
use crate::updates::UpdateSender;

/// Editable clones keyed by their origin's identity.
pub struct CloneRegistry {
    storage: StorageMap,
    identity: Arc<Identity>,
}

impl CloneRegistry {
    /// Create an empty registry.
    pub fn new(identity: Arc<Identity>, model: Arc<Model>, updates: UpdateSender) -> Self {
        Self {
            storage: StorageMap::new(
                Tier::Clones,
                KeySource::AnyId,
                Arc::clone(&identity),
                model,
                updates,
            ),
            identity,
        }
    }

    /// The underlying storage map.
    pub fn storage(&self) -> &StorageMap {
        &self.storage
    }

    /// The clone stored under `key`.
    pub fn get(&self, key: &str) -> Option<Record> {
        self.storage.get_item(key)
    }

    /// Clone `record`, storing it in items or temps first if neither has it.
    ///
    /// With `reuse_existing`, an existing clone is returned unchanged;
    /// otherwise the existing clone is reset to the origin.
    pub fn clone_record(
        &self,
        canonical: &Canonical<'_>,
        record: &Record,
        overrides: Option<&Record>,
        reuse_existing: bool,
    ) -> Result<Record> {
        let origin = self.ensure_origin(canonical, record)?;
        let key = self.key_of(&origin)?;

        if reuse_existing && let Some(existing) = self.storage.get_item(&key) {
            trace!(key = %key, "reusing existing clone");
            return Ok(existing);
        }
        Ok(self.reset_from_origin(&key, origin, overrides))
    }

    /// Overwrite the clone of `record` with a fresh copy of its origin.
    ///
    /// Fields present only on the previous clone are dropped. `overrides` are
    /// applied last but never change the identity fields.
    pub fn reset(
        &self,
        canonical: &Canonical<'_>,
        record: &Record,
        overrides: Option<&Record>,
    ) -> Result<Record> {
        let origin = self.ensure_origin(canonical, record)?;
        let key = self.key_of(&origin)?;
        Ok(self.reset_from_origin(&key, origin, overrides))
    }

    /// Write a clone's fields back onto its canonical origin.
    ///
    /// The clone stays in the registry and remains editable.
    pub fn commit(
        &self,
        canonical: &Canonical<'_>,
        clone: &Record,
        overrides: Option<&Record>,
    ) -> Result<Record> {
        if !is_clone(clone) {
            return Err(StoreError::NotAClone);
        }
        let mut data = clone.clone();
        data.insert(CLONE_FLAG.to_string(), Value::Bool(false));
        if let Some(overrides) = overrides {
            data.extend(overrides.clone());
        }
        canonical.write(data)
    }

    /// Move a clone from its temp id to the permanent id assigned on create.
    pub fn migrate(&self, temp_id: &str, id: &str, id_value: &Value) -> Option<Record> {
        let id_field = self.identity.id_field().to_string();
        let identity = Arc::clone(&self.identity);
        self.storage.rekey(temp_id, id, move |clone| {
            identity.strip_temp_id(clone);
            clone.insert(id_field, id_value.clone());
        })
    }

    /// Remove the clone under `key`.
    pub fn remove(&self, key: &str) -> bool {
        self.storage.remove_item(key)
    }

    fn key_of(&self, record: &Record) -> Result<String> {
        self.identity
            .any_id_of(record)
            .ok_or_else(|| StoreError::invalid_identity(self.identity.id_field()))
    }

    fn ensure_origin(&self, canonical: &Canonical<'_>, record: &Record) -> Result<Record> {
        if let Some(origin) = canonical.origin(record) {
            return Ok(origin);
        }
        let mut data = record.clone();
        data.remove(CLONE_FLAG);
        canonical.write(data)
    }

    fn reset_from_origin(&self, key: &str, origin: Record, overrides: Option<&Record>) -> Record {
        let mut copy = origin.clone();
        copy.insert(CLONE_FLAG.to_string(), Value::Bool(true));
        if let Some(overrides) = overrides {
            copy.extend(overrides.clone());
            for field in [self.identity.id_field(), self.identity.temp_id_field()] {
                match origin.get(field) {
                    Some(value) => copy.insert(field.to_string(), value.clone()),
                    None => copy.remove(field),
                };
            }
        }
        self.storage.set_item(key, copy)
    }
}
