//! Record handles bound to their store.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::orchestrator::PatchOptions;
use crate::pending::Operation;
use crate::store::Store;
use crate::types::{Params, Record, is_clone};

/// One record plus the store it belongs to.
///
/// The record is a detached copy; methods that write return a fresh handle
/// or refresh this one from the store's response.
#[derive(Clone)]
pub struct Instance {
    store: Arc<Store>,
    record: Record,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("store", &self.store.name())
            .field("record", &self.record)
            .finish()
    }
}

impl Instance {
    pub(crate) fn new(store: Arc<Store>, record: Record) -> Self {
        Self { store, record }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut Record {
        &mut self.record
    }

    pub fn into_record(self) -> Record {
        self.record
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.record.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) -> &mut Self {
        self.record.insert(field.into(), value);
        self
    }

    /// Permanent id, if the record has been saved.
    pub fn id(&self) -> Option<String> {
        self.store.identity().id_of(&self.record)
    }

    pub fn temp_id(&self) -> Option<String> {
        self.store.identity().temp_id_of(&self.record)
    }

    pub fn is_clone(&self) -> bool {
        is_clone(&self.record)
    }

    pub fn is_pending(&self, operation: Operation) -> bool {
        self.pending_key()
            .is_some_and(|key| self.store.pending().is_pending(operation, &key))
    }

    pub fn is_creating(&self) -> bool {
        self.is_pending(Operation::Create)
    }

    pub fn is_patching(&self) -> bool {
        self.is_pending(Operation::Patch)
    }

    pub fn is_removing(&self) -> bool {
        self.is_pending(Operation::Remove)
    }

    /// Any create/update/patch/remove in flight for this record.
    pub fn is_saving_or_removing(&self) -> bool {
        self.pending_key()
            .is_some_and(|key| self.store.pending().is_any_pending(&key))
    }

    fn pending_key(&self) -> Option<String> {
        self.store.identity().any_id_of(&self.record)
    }

    fn rebind(&self, record: Record) -> Self {
        Self::new(Arc::clone(&self.store), record)
    }

    /// Store the record locally and rebind to the stored copy.
    pub fn add(&mut self) -> Result<&mut Self> {
        self.record = self.store.add_or_update(self.record.clone())?;
        Ok(self)
    }

    /// Remove the record from every local tier.
    pub fn remove_from_store(&self) -> bool {
        self.store.remove_from_store(&self.record)
    }

    /// An editable clone, reusing an existing one.
    pub fn clone_record(&self, overrides: Option<&Record>) -> Result<Self> {
        let clone = self.store.clone_record(&self.record, overrides, true)?;
        Ok(self.rebind(clone))
    }

    /// Write this clone's fields onto the canonical record.
    pub fn commit(&self, overrides: Option<&Record>) -> Result<Self> {
        let committed = self.store.commit(&self.record, overrides)?;
        Ok(self.rebind(committed))
    }

    /// Discard this clone's edits.
    pub fn reset(&mut self, overrides: Option<&Record>) -> Result<&mut Self> {
        self.record = self.store.reset_clone(&self.record, overrides)?;
        Ok(self)
    }

    /// Create the record when it has no permanent id, patch it otherwise.
    ///
    /// A saved clone stays a clone: after the call this handle holds the
    /// clone stored under the permanent id.
    pub async fn save(&mut self, options: &PatchOptions) -> Result<&mut Self> {
        let was_clone = self.is_clone();
        let saved = match self.id() {
            Some(id) => self.store.patch(&id, &self.record, options).await?,
            None => self.store.create(&self.record, &options.params).await?,
        };

        self.record = match self.store.identity().id_of(&saved) {
            Some(id) if was_clone => self.store.clone_of(&id).unwrap_or(saved),
            _ => saved,
        };
        Ok(self)
    }

    /// Remove the record on the service, or locally when it was never saved.
    pub async fn remove(&self, params: &Params) -> Result<Option<Record>> {
        match self.id().or_else(|| self.temp_id()) {
            Some(key) => self.store.remove(&key, params).await,
            None => Ok(None),
        }
    }

    /// Resolve an association declared on the store's model.
    pub fn association(&self, name: &str) -> Option<Value> {
        self.store.resolve_association(&self.record, name)
    }
}
