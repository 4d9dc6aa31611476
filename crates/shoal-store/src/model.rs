//! Model hooks: upgrading plain records on write and derived fields.
//!
//! Every value written to storage passes through [`Model::on_write`] and
//! every value read passes through [`Model::on_read`]. Associations are
//! declared explicitly against a field name instead of being intercepted at
//! runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::identity::key_of;
use crate::store::Store;
use crate::types::{Params, Record};

/// Upgrades plain data into live application instances.
///
/// `instantiate` must be idempotent: applying it to an already-upgraded
/// record returns an equal record.
pub trait ModelFactory: Send + Sync {
    /// Write hook applied to every value entering storage.
    fn instantiate(&self, raw: Record) -> Record {
        raw
    }

    /// Read hook applied to every value leaving storage.
    fn present(&self, stored: Record) -> Record {
        stored
    }
}

/// Factory that stores records as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainModel;

impl ModelFactory for PlainModel {}

/// Factory filling in default field values for records that lack them.
#[derive(Debug, Clone, Default)]
pub struct DefaultsModel {
    defaults: Record,
}

impl DefaultsModel {
    /// Create a factory with the given defaults.
    pub fn new(defaults: Record) -> Self {
        Self { defaults }
    }
}

impl ModelFactory for DefaultsModel {
    fn instantiate(&self, mut raw: Record) -> Record {
        for (field, value) in &self.defaults {
            if !raw.contains_key(field) {
                raw.insert(field.clone(), value.clone());
            }
        }
        raw
    }
}

/// Getter resolving an association's value for a record.
pub type AssociationGetter = Arc<dyn Fn(&Record) -> Option<Value> + Send + Sync>;

/// Setter receiving a value written to an association field.
pub type AssociationSetter = Arc<dyn Fn(&mut Record, Value) + Send + Sync>;

/// A derived field with an explicit getter and an optional setter hook.
#[derive(Clone)]
pub struct Association {
    getter: AssociationGetter,
    setter: Option<AssociationSetter>,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("has_setter", &self.setter.is_some())
            .finish()
    }
}

impl Association {
    /// Association resolved by `getter`, with no setter.
    pub fn new(getter: impl Fn(&Record) -> Option<Value> + Send + Sync + 'static) -> Self {
        Self {
            getter: Arc::new(getter),
            setter: None,
        }
    }

    /// Attach a setter hook.
    ///
    /// When a written record carries the association's field, the field is
    /// removed and its value handed to the setter.
    pub fn with_setter(
        mut self,
        setter: impl Fn(&mut Record, Value) + Send + Sync + 'static,
    ) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// One related record in `target`, referenced by `foreign_key`.
    ///
    /// Writing a nested object to the field stores it in `target` and keeps
    /// only its id in `foreign_key`.
    pub fn belongs_to(target: Arc<Store>, foreign_key: impl Into<String>) -> Self {
        let foreign_key = foreign_key.into();
        let getter_store = Arc::clone(&target);
        let getter_key = foreign_key.clone();
        Self::new(move |record| {
            let id = record.get(&getter_key).and_then(key_of)?;
            getter_store
                .get_from_store(&id, &Params::default())
                .map(Value::Object)
        })
        .with_setter(move |record, value| {
            let Value::Object(related) = value else {
                return;
            };
            match target.add_or_update(related) {
                Ok(stored) => {
                    if let Some(id) = stored.get(target.identity().id_field()) {
                        record.insert(foreign_key.clone(), id.clone());
                    }
                }
                Err(e) => warn!(error = %e, "failed to store associated record"),
            }
        })
    }

    /// Related records in `target` selected by a query built from the record.
    ///
    /// Writing an array to the field stores each element in `target`.
    pub fn has_many(
        target: Arc<Store>,
        params: impl Fn(&Record) -> Params + Send + Sync + 'static,
    ) -> Self {
        let getter_store = Arc::clone(&target);
        Self::new(move |record| {
            let response = getter_store.find_in_store(&params(record)).ok()?;
            Some(Value::Array(
                response.data.into_iter().map(Value::Object).collect(),
            ))
        })
        .with_setter(move |_record, value| {
            let Value::Array(related) = value else {
                return;
            };
            for item in related {
                if let Value::Object(item) = item
                    && let Err(e) = target.add_or_update(item)
                {
                    warn!(error = %e, "failed to store associated record");
                }
            }
        })
    }
}

/// Associations declared for a store, keyed by field name.
#[derive(Clone, Debug, Default)]
pub struct Associations {
    by_name: HashMap<String, Association>,
}

impl Associations {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an association under `name`.
    pub fn define(mut self, name: impl Into<String>, association: Association) -> Self {
        self.by_name.insert(name.into(), association);
        self
    }

    /// Resolve the association `name` for `record`.
    pub fn resolve(&self, record: &Record, name: &str) -> Option<Value> {
        self.by_name.get(name).and_then(|a| (a.getter)(record))
    }

    /// Run setter hooks for any association fields present on `record`.
    pub fn apply_setters(&self, mut record: Record) -> Record {
        for (name, association) in &self.by_name {
            let Some(setter) = &association.setter else {
                continue;
            };
            if let Some(value) = record.remove(name) {
                setter(&mut record, value);
            }
        }
        record
    }

    /// Declared association names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

/// Model factory plus associations: the read/write seam used by storage.
#[derive(Clone)]
pub struct Model {
    factory: Arc<dyn ModelFactory>,
    associations: Associations,
}

impl Default for Model {
    fn default() -> Self {
        Self::new(Arc::new(PlainModel), Associations::default())
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("associations", &self.associations)
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Combine a factory with associations.
    pub fn new(factory: Arc<dyn ModelFactory>, associations: Associations) -> Self {
        Self {
            factory,
            associations,
        }
    }

    /// Write hook.
    pub fn on_write(&self, raw: Record) -> Record {
        let record = self.associations.apply_setters(raw);
        self.factory.instantiate(record)
    }

    /// Read hook.
    pub fn on_read(&self, stored: Record) -> Record {
        self.factory.present(stored)
    }

    /// Declared associations.
    pub fn associations(&self) -> &Associations {
        &self.associations
    }
}
