//! Temp registry: canonical records that have no permanent id yet.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::identity::Identity;
use crate::model::Model;
use crate::storage::{KeySource, StorageMap, Tier};
use crate::types::Record;
use crate::updates::{StoreUpdate, UpdateSender};

/// Records lacking a permanent id, keyed by temp id.
pub struct TempRegistry {
    storage: StorageMap,
    identity: Arc<Identity>,
    updates: UpdateSender,
}

impl TempRegistry {
    /// Create an empty registry.
    pub fn new(identity: Arc<Identity>, model: Arc<Model>, updates: UpdateSender) -> Self {
        Self {
            storage: StorageMap::new(
                Tier::Temps,
                KeySource::TempId,
                Arc::clone(&identity),
                model,
                updates.clone(),
            ),
            identity,
            updates,
        }
    }

    /// The underlying storage map.
    pub fn storage(&self) -> &StorageMap {
        &self.storage
    }

    /// Store a record under its temp id, assigning one if it has none.
    pub fn add(&self, mut record: Record) -> Result<Record> {
        self.identity.ensure_temp_id(&mut record);
        self.storage.merge(record)
    }

    /// Promote a record that now carries a permanent id into `items`.
    ///
    /// Any temp entry with the record's temp id is merged with the record,
    /// written to `items` under the permanent id and removed. The temp id is
    /// stripped from both the stored item and `record`. Calling this twice
    /// with the same input leaves the same stored state.
    pub fn move_to_permanent(&self, record: &mut Record, items: &StorageMap) -> Result<Record> {
        let id = self
            .identity
            .id_of(record)
            .ok_or_else(|| StoreError::invalid_identity(self.identity.id_field()))?;
        let temp_id = self.identity.temp_id_of(record);

        let mut merged = match temp_id.as_deref().and_then(|t| self.storage.get_item(t)) {
            Some(mut existing) => {
                existing.extend(record.clone());
                existing
            }
            None => record.clone(),
        };
        self.identity.strip_temp_id(&mut merged);
        let stored = items.merge_item(&id, merged);

        if let Some(temp_id) = temp_id
            && self.storage.remove_item(&temp_id)
        {
            debug!(temp_id = %temp_id, id = %id, "temp moved to items");
            self.updates.send(StoreUpdate::TempMigrated {
                temp_id,
                id: id.clone(),
            });
        }

        self.identity.strip_temp_id(record);
        Ok(stored)
    }
}

/// Read/write view over the two canonical tiers (items and temps).
pub struct Canonical<'a> {
    pub items: &'a StorageMap,
    pub temps: &'a TempRegistry,
    pub identity: &'a Identity,
}

impl Canonical<'_> {
    /// The canonical copy of `record`, from items or temps.
    pub fn origin(&self, record: &Record) -> Option<Record> {
        if let Some(id) = self.identity.id_of(record)
            && let Some(item) = self.items.get_item(&id)
        {
            return Some(item);
        }
        self.identity
            .temp_id_of(record)
            .and_then(|temp_id| self.temps.storage().get_item(&temp_id))
    }

    /// The canonical record stored under `key` (permanent id first).
    pub fn origin_by_key(&self, key: &str) -> Option<Record> {
        self.items
            .get_item(key)
            .or_else(|| self.temps.storage().get_item(key))
    }

    /// Whether either tier holds `record`.
    pub fn contains(&self, record: &Record) -> bool {
        self.origin(record).is_some()
    }

    /// Add or update a canonical record.
    ///
    /// Records with a permanent id go to items (promoting a matching temp);
    /// records without one go to temps under a temp id.
    pub fn write(&self, mut record: Record) -> Result<Record> {
        if self.identity.id_of(&record).is_some() {
            if self.identity.temp_id_of(&record).is_some() {
                return self.temps.move_to_permanent(&mut record, self.items);
            }
            return self.items.merge(record);
        }
        self.temps.add(record)
    }

    /// Replace the canonical record wholesale (no field merge).
    pub fn replace(&self, record: Record) -> Result<Record> {
        if self.identity.id_of(&record).is_some() {
            return self.items.set(record);
        }
        self.temps.storage().set(record)
    }

    /// Remove `record` from both tiers. Returns whether anything was removed.
    pub fn remove(&self, record: &Record) -> bool {
        let mut removed = false;
        if let Some(id) = self.identity.id_of(record) {
            removed |= self.items.remove_item(&id);
        }
        if let Some(temp_id) = self.identity.temp_id_of(record) {
            removed |= self.temps.storage().remove_item(&temp_id);
        }
        removed
    }
}
