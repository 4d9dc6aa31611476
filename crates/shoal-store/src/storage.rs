//! Keyed record container.
//!
//! `StorageMap` is the unit of storage reused for items, temps and clones.
//! Entries remember their insertion order so listings (and therefore stable
//! sorts over them) are deterministic.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, StoreError};
use crate::identity::Identity;
use crate::model::Model;
use crate::types::Record;
use crate::updates::{StoreUpdate, UpdateSender};

/// The three storage tiers of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Tier {
    /// Canonical records with a permanent id.
    Items,
    /// Canonical records awaiting a permanent id.
    Temps,
    /// Editable copies of items or temps.
    Clones,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Items => write!(f, "items"),
            Tier::Temps => write!(f, "temps"),
            Tier::Clones => write!(f, "clones"),
        }
    }
}

/// Which identity keys a storage map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Permanent id only.
    Id,
    /// Temp id only.
    TempId,
    /// Permanent id, else temp id.
    AnyId,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    value: Record,
    seq: u64,
}

/// A keyed container of records with read/write hooks.
pub struct StorageMap {
    tier: Tier,
    key_source: KeySource,
    identity: Arc<Identity>,
    model: Arc<Model>,
    entries: DashMap<String, StoredRecord>,
    next_seq: AtomicU64,
    updates: UpdateSender,
}

impl StorageMap {
    /// Create an empty storage map.
    pub fn new(
        tier: Tier,
        key_source: KeySource,
        identity: Arc<Identity>,
        model: Arc<Model>,
        updates: UpdateSender,
    ) -> Self {
        Self {
            tier,
            key_source,
            identity,
            model,
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            updates,
        }
    }

    /// The tier this map stores.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Compute the storage key of a record.
    pub fn key_of(&self, record: &Record) -> Option<String> {
        match self.key_source {
            KeySource::Id => self.identity.id_of(record),
            KeySource::TempId => self.identity.temp_id_of(record),
            KeySource::AnyId => self.identity.any_id_of(record),
        }
    }

    fn require_key(&self, record: &Record) -> Result<String> {
        self.key_of(record).ok_or_else(|| {
            let field = match self.key_source {
                KeySource::TempId => self.identity.temp_id_field(),
                KeySource::Id | KeySource::AnyId => self.identity.id_field(),
            };
            StoreError::invalid_identity(field)
        })
    }

    /// Whether the record's key is present.
    pub fn has(&self, record: &Record) -> bool {
        self.key_of(record).is_some_and(|key| self.has_id(&key))
    }

    /// Whether `id` is present.
    pub fn has_id(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Read the stored copy of a record.
    pub fn get(&self, record: &Record) -> Option<Record> {
        self.key_of(record).and_then(|key| self.get_item(&key))
    }

    /// Read the record stored under `id`.
    pub fn get_item(&self, id: &str) -> Option<Record> {
        let value = self.entries.get(id).map(|entry| entry.value.clone())?;
        Some(self.model.on_read(value))
    }

    /// Store a record under its own key, replacing any previous value.
    pub fn set(&self, record: Record) -> Result<Record> {
        let key = self.require_key(&record)?;
        Ok(self.set_item(&key, record))
    }

    /// Store a record under `id`, replacing any previous value.
    ///
    /// A replaced entry keeps its original insertion position.
    pub fn set_item(&self, id: &str, record: Record) -> Record {
        let value = self.model.on_write(record);
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                let seq = entry.get().seq;
                entry.insert(StoredRecord {
                    value: value.clone(),
                    seq,
                });
            }
            Entry::Vacant(entry) => {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                entry.insert(StoredRecord {
                    value: value.clone(),
                    seq,
                });
            }
        }
        trace!(tier = %self.tier, id, "storage: record set");
        self.updates.send(StoreUpdate::Stored {
            tier: self.tier,
            id: id.to_string(),
            record: value.clone(),
        });
        self.model.on_read(value)
    }

    /// Shallow-assign `record` onto the existing entry, or insert it.
    pub fn merge(&self, record: Record) -> Result<Record> {
        let key = self.require_key(&record)?;
        Ok(self.merge_item(&key, record))
    }

    /// Shallow-assign `record` onto the entry under `id`, or insert it.
    pub fn merge_item(&self, id: &str, record: Record) -> Record {
        let merged = match self.entries.get(id) {
            Some(existing) => {
                let mut merged = existing.value.clone();
                merged.extend(record);
                merged
            }
            None => record,
        };
        self.set_item(id, merged)
    }

    /// Remove a record by its own key. Returns whether it was present.
    pub fn remove(&self, record: &Record) -> Result<bool> {
        let key = self.require_key(record)?;
        Ok(self.remove_item(&key))
    }

    /// Remove the record under `id`. Returns whether it was present.
    pub fn remove_item(&self, id: &str) -> bool {
        if self.entries.remove(id).is_some() {
            trace!(tier = %self.tier, id, "storage: record removed");
            self.updates.send(StoreUpdate::Removed {
                tier: self.tier,
                id: id.to_string(),
            });
            true
        } else {
            false
        }
    }

    /// Move the entry under `from` to `to`, editing it on the way.
    ///
    /// The entry keeps its insertion position. Returns the stored result, or
    /// `None` if nothing was stored under `from`.
    pub fn rekey(&self, from: &str, to: &str, edit: impl FnOnce(&mut Record)) -> Option<Record> {
        let (_, mut stored) = self.entries.remove(from)?;
        edit(&mut stored.value);
        let value = self.model.on_write(stored.value);
        self.entries.insert(
            to.to_string(),
            StoredRecord {
                value: value.clone(),
                seq: stored.seq,
            },
        );
        trace!(tier = %self.tier, from, to, "storage: record rekeyed");
        self.updates.send(StoreUpdate::Removed {
            tier: self.tier,
            id: from.to_string(),
        });
        self.updates.send(StoreUpdate::Stored {
            tier: self.tier,
            id: to.to_string(),
            record: value.clone(),
        });
        Some(self.model.on_read(value))
    }

    /// All records in insertion order.
    pub fn list(&self) -> Vec<Record> {
        self.entries()
            .into_iter()
            .map(|(_, record)| record)
            .collect()
    }

    /// All keys in insertion order.
    pub fn ids(&self) -> Vec<String> {
        let mut keyed: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().seq, entry.key().clone()))
            .collect();
        keyed.sort_by_key(|(seq, _)| *seq);
        keyed.into_iter().map(|(_, key)| key).collect()
    }

    /// All `(key, record)` pairs in insertion order.
    pub fn entries(&self) -> Vec<(String, Record)> {
        let mut keyed: Vec<(u64, String, Record)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().seq, entry.key().clone(), entry.value().value.clone()))
            .collect();
        keyed.sort_by_key(|(seq, _, _)| *seq);
        keyed
            .into_iter()
            .map(|(_, key, value)| (key, self.model.on_read(value)))
            .collect()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every record.
    pub fn clear(&self) {
        self.entries.clear();
        trace!(tier = %self.tier, "storage: cleared");
        self.updates.send(StoreUpdate::Cleared { tier: self.tier });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::into_record;
    use serde_json::{Value, json};

    fn rec(value: Value) -> Record {
        into_record(value).unwrap()
    }

    fn items() -> StorageMap {
        StorageMap::new(
            Tier::Items,
            KeySource::Id,
            Arc::new(Identity::default()),
            Arc::new(Model::default()),
            UpdateSender::new(),
        )
    }

    #[test]
    fn test_set_and_get() {
        let map = items();
        map.set(rec(json!({"id": 1, "text": "a"}))).unwrap();

        assert!(map.has_id("1"));
        assert!(map.has(&rec(json!({"id": 1}))));
        assert_eq!(map.get_item("1").unwrap()["text"], "a");
        assert_eq!(map.get(&rec(json!({"id": 1}))).unwrap()["text"], "a");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_set_requires_identity() {
        let map = items();
        let result = map.set(rec(json!({"text": "a"})));
        assert!(matches!(result, Err(StoreError::InvalidIdentity { .. })));
        assert!(matches!(
            map.merge(rec(json!({"id": null}))),
            Err(StoreError::InvalidIdentity { .. })
        ));
        assert!(matches!(
            map.remove(&rec(json!({}))),
            Err(StoreError::InvalidIdentity { .. })
        ));
    }

    #[test]
    fn test_merge_keeps_existing_fields() {
        let map = items();
        map.set(rec(json!({"id": 1, "text": "a", "done": false}))).unwrap();
        let merged = map.merge(rec(json!({"id": 1, "done": true}))).unwrap();

        assert_eq!(merged, rec(json!({"id": 1, "text": "a", "done": true})));
        assert_eq!(map.get_item("1").unwrap(), merged);
    }

    #[test]
    fn test_merge_inserts_when_absent() {
        let map = items();
        map.merge(rec(json!({"id": "x", "n": 1}))).unwrap();
        assert_eq!(map.ids(), vec!["x".to_string()]);
    }

    #[test]
    fn test_list_preserves_insertion_order() {
        let map = items();
        for id in [5, 1, 3, 2] {
            map.set(rec(json!({"id": id}))).unwrap();
        }
        // Replacing an entry does not move it.
        map.set(rec(json!({"id": 1, "touched": true}))).unwrap();

        assert_eq!(map.ids(), vec!["5", "1", "3", "2"]);
        let listed: Vec<Value> = map.list().into_iter().map(|r| r["id"].clone()).collect();
        assert_eq!(listed, vec![json!(5), json!(1), json!(3), json!(2)]);
    }

    #[test]
    fn test_remove() {
        let map = items();
        map.set(rec(json!({"id": 1}))).unwrap();
        assert!(map.remove(&rec(json!({"id": 1}))).unwrap());
        assert!(!map.remove_item("1"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_rekey_keeps_position() {
        let map = StorageMap::new(
            Tier::Clones,
            KeySource::AnyId,
            Arc::new(Identity::default()),
            Arc::new(Model::default()),
            UpdateSender::new(),
        );
        map.set(rec(json!({"__tempId": "t1", "text": "a"}))).unwrap();
        map.set(rec(json!({"id": 9}))).unwrap();

        let moved = map
            .rekey("t1", "4", |record| {
                record.remove("__tempId");
                record.insert("id".into(), json!(4));
            })
            .unwrap();

        assert_eq!(moved, rec(json!({"text": "a", "id": 4})));
        assert_eq!(map.ids(), vec!["4", "9"]);
        assert!(map.rekey("missing", "x", |_| {}).is_none());
    }

    #[test]
    fn test_clear_broadcasts() {
        let updates = UpdateSender::new();
        let mut rx = updates.subscribe();
        let map = StorageMap::new(
            Tier::Items,
            KeySource::Id,
            Arc::new(Identity::default()),
            Arc::new(Model::default()),
            updates,
        );
        map.set(rec(json!({"id": 1}))).unwrap();
        map.clear();

        assert!(matches!(rx.try_recv().unwrap(), StoreUpdate::Stored { tier: Tier::Items, .. }));
        assert_eq!(rx.try_recv().unwrap(), StoreUpdate::Cleared { tier: Tier::Items });
    }
}
