//! The record store: storage tiers, local queries and clone workflows.
//!
//! A [`Store`] owns one item map, one temp registry and one clone registry,
//! all keyed through the same [`Identity`]. Local reads and writes live
//! here; remote operations are in [`crate::orchestrator`].

use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::clones::CloneRegistry;
use crate::config::StoreConfig;
use crate::error::{ConfigError, Result, StoreError};
use crate::events::{EventFilter, EventQueue};
use crate::identity::Identity;
use crate::instance::Instance;
use crate::model::{Associations, Model, ModelFactory, PlainModel};
use crate::pagination::PaginationLedger;
use crate::pending::PendingTracker;
use crate::query::{QueryEngine, strip_paging};
use crate::service::{EventKind, RemoteService};
use crate::storage::{KeySource, StorageMap, Tier};
use crate::temps::{Canonical, TempRegistry};
use crate::types::{CLONE_FLAG, FindResponse, Params, Record, is_clone};
use crate::updates::{StoreUpdate, UpdateSender};

/// Plain-JSON copy of the canonical tiers for persistence helpers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub items_by_id: Record,
    pub temps_by_id: Record,
}

/// A normalized record cache for one remote service.
pub struct Store {
    pub(crate) config: StoreConfig,
    pub(crate) identity: Arc<Identity>,
    pub(crate) model: Arc<Model>,
    pub(crate) items: StorageMap,
    pub(crate) temps: TempRegistry,
    pub(crate) clones: CloneRegistry,
    pub(crate) engine: QueryEngine,
    pub(crate) ledger: PaginationLedger,
    pub(crate) pending: PendingTracker,
    pub(crate) service: Option<Arc<dyn RemoteService>>,
    pub(crate) events: Option<EventQueue>,
    pub(crate) event_filter: Option<EventFilter>,
    pub(crate) updates: UpdateSender,
    /// Handle for tasks spawned by the store itself.
    pub(crate) this: Weak<Store>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.config.name)
            .field("items", &self.items.len())
            .field("temps", &self.temps.storage().len())
            .field("clones", &self.clones.storage().len())
            .finish_non_exhaustive()
    }
}

/// Two-phase constructor for [`Store`].
pub struct StoreBuilder {
    config: StoreConfig,
    service: Option<Arc<dyn RemoteService>>,
    factory: Option<Arc<dyn ModelFactory>>,
    associations: Associations,
    event_filter: Option<EventFilter>,
}

impl StoreBuilder {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            service: None,
            factory: None,
            associations: Associations::default(),
            event_filter: None,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Remote service backing find/get/create/update/patch/remove.
    pub fn service(mut self, service: Arc<dyn RemoteService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Model factory applied to every stored value.
    pub fn model(mut self, factory: Arc<dyn ModelFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn associations(mut self, associations: Associations) -> Self {
        self.associations = associations;
        self
    }

    /// Only apply live events accepted by `filter`.
    pub fn event_filter(
        mut self,
        filter: impl Fn(EventKind, &Record) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.event_filter = Some(Arc::new(filter));
        self
    }

    /// Validate the config and build the store.
    pub fn build(self) -> std::result::Result<Arc<Store>, ConfigError> {
        self.config.validate()?;
        let identity = Arc::new(self.config.identity());
        let factory = self.factory.unwrap_or_else(|| Arc::new(PlainModel));
        let model = Arc::new(Model::new(factory, self.associations));
        let updates = UpdateSender::new();

        let store = Arc::new_cyclic(|this| Store {
            this: this.clone(),
            items: StorageMap::new(
                Tier::Items,
                KeySource::Id,
                Arc::clone(&identity),
                Arc::clone(&model),
                updates.clone(),
            ),
            temps: TempRegistry::new(Arc::clone(&identity), Arc::clone(&model), updates.clone()),
            clones: CloneRegistry::new(Arc::clone(&identity), Arc::clone(&model), updates.clone()),
            engine: QueryEngine::new(
                Arc::clone(&identity),
                self.config.operator_policy(),
                self.config.params_for_server.clone(),
            ),
            ledger: PaginationLedger::new(updates.clone()),
            pending: PendingTracker::new(updates.clone()),
            events: self.config.debounce().map(EventQueue::new),
            service: self.service,
            event_filter: self.event_filter,
            config: self.config,
            identity,
            model,
            updates,
        });
        debug!(store = %store.config.name, "store built");
        Ok(store)
    }
}

impl Store {
    /// A store with default config and no remote service.
    pub fn local(name: impl Into<String>) -> std::result::Result<Arc<Self>, ConfigError> {
        StoreBuilder::new(StoreConfig::named(name)).build()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn items(&self) -> &StorageMap {
        &self.items
    }

    pub fn temps(&self) -> &StorageMap {
        self.temps.storage()
    }

    pub fn clones(&self) -> &StorageMap {
        self.clones.storage()
    }

    pub fn ledger(&self) -> &PaginationLedger {
        &self.ledger
    }

    pub fn pending(&self) -> &PendingTracker {
        &self.pending
    }

    /// Subscribe to storage, pending and ledger changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    pub(crate) fn canonical(&self) -> Canonical<'_> {
        Canonical {
            items: &self.items,
            temps: &self.temps,
            identity: &self.identity,
        }
    }

    // =========================================================================
    // Local writes
    // =========================================================================

    /// Add a record or merge it onto its stored copy.
    ///
    /// Clones go to the clone registry. Records with a permanent id go to
    /// items (promoting a temp that carries the same temp id); the rest go
    /// to temps under a generated temp id.
    pub fn add_or_update(&self, record: Record) -> Result<Record> {
        if is_clone(&record) {
            return self.clones.storage().merge(record);
        }
        self.canonical().write(record)
    }

    /// [`add_or_update`](Self::add_or_update) for each record, in order.
    pub fn add_all(&self, records: impl IntoIterator<Item = Record>) -> Result<Vec<Record>> {
        records
            .into_iter()
            .map(|record| self.add_or_update(record))
            .collect()
    }

    /// Remove a record from items, temps and clones.
    pub fn remove_from_store(&self, record: &Record) -> bool {
        let mut removed = self.canonical().remove(record);
        for key in [self.identity.id_of(record), self.identity.temp_id_of(record)]
            .into_iter()
            .flatten()
        {
            removed |= self.clones.remove(&key);
        }
        removed
    }

    /// Remove whatever is stored under `key` in any tier.
    pub fn remove_by_key(&self, key: &str) -> bool {
        let mut removed = self.items.remove_item(key);
        removed |= self.temps.storage().remove_item(key);
        removed |= self.clones.remove(key);
        removed
    }

    /// Empty every tier, the pagination ledger and pending state.
    pub fn clear_all(&self) {
        self.items.clear();
        self.temps.storage().clear();
        self.clones.storage().clear();
        self.ledger.clear();
        self.pending.clear();
        debug!(store = %self.config.name, "store cleared");
    }

    // =========================================================================
    // Local reads
    // =========================================================================

    /// Evaluate `params.query` against stored records.
    ///
    /// Candidates are items, plus temps with `params.temps`. With
    /// `params.clones`, each candidate is replaced by its clone when one
    /// exists before filtering.
    pub fn find_in_store(&self, params: &Params) -> Result<FindResponse> {
        let query = params.query.clone().unwrap_or_default();
        let plan = self.engine.plan(&query)?;
        Ok(self.engine.run(&plan, self.candidates(params)))
    }

    pub(crate) fn candidates(&self, params: &Params) -> Vec<Record> {
        let mut candidates = self.items.list();
        if params.temps {
            candidates.extend(self.temps.storage().list());
        }
        if params.clones {
            candidates = candidates
                .into_iter()
                .map(|record| self.prefer_clone(record))
                .collect();
        }
        candidates
    }

    pub(crate) fn prefer_clone(&self, record: Record) -> Record {
        self.identity
            .any_id_of(&record)
            .and_then(|key| self.clones.get(&key))
            .unwrap_or(record)
    }

    /// Clone, item or temp stored under `id`, in that priority.
    ///
    /// Clones are only considered with `params.clones`. A `$select` in
    /// `params.query` projects the returned copy. A missing id is `None`.
    pub fn get_from_store(&self, id: &str, params: &Params) -> Option<Record> {
        let clone = if params.clones {
            self.clones.get(id)
        } else {
            None
        };
        let record = clone.or_else(|| self.canonical().origin_by_key(id))?;

        let select = params
            .query
            .as_ref()
            .and_then(|query| query.get("$select"))
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            });
        Some(match select {
            Some(fields) => self.engine.project(&record, &fields),
            None => record,
        })
    }

    /// Number of stored records matching `params.query`.
    ///
    /// Fails with [`StoreError::MissingQuery`] when no query is given.
    pub fn count_in_store(&self, params: &Params) -> Result<usize> {
        let query = params.query.as_ref().ok_or(StoreError::MissingQuery)?;
        let params = params.with_query(strip_paging(query));
        Ok(self.find_in_store(&params)?.total)
    }

    /// Resolve the association `name` for `record`.
    pub fn resolve_association(&self, record: &Record, name: &str) -> Option<Value> {
        self.model.associations().resolve(record, name)
    }

    // =========================================================================
    // Clones
    // =========================================================================

    /// Get an editable clone of `record`, storing the record first if needed.
    ///
    /// With `reuse_existing`, an existing clone is returned as-is; otherwise
    /// it is reset to the canonical record.
    pub fn clone_record(
        &self,
        record: &Record,
        overrides: Option<&Record>,
        reuse_existing: bool,
    ) -> Result<Record> {
        self.clones
            .clone_record(&self.canonical(), record, overrides, reuse_existing)
    }

    /// Reset the clone of `record` to match its canonical copy.
    pub fn reset_clone(&self, record: &Record, overrides: Option<&Record>) -> Result<Record> {
        self.clones.reset(&self.canonical(), record, overrides)
    }

    /// Write a clone's fields onto its canonical copy.
    pub fn commit(&self, clone: &Record, overrides: Option<&Record>) -> Result<Record> {
        self.clones.commit(&self.canonical(), clone, overrides)
    }

    /// Store edits made to a clone without committing them.
    pub fn save_clone(&self, clone: Record) -> Result<Record> {
        if !is_clone(&clone) {
            return Err(StoreError::NotAClone);
        }
        self.clones.storage().set(clone)
    }

    /// The clone stored under `key`.
    pub fn clone_of(&self, key: &str) -> Option<Record> {
        self.clones.get(key)
    }

    /// A handle bound to this store for one record.
    pub fn instance(self: &Arc<Self>, record: Record) -> Instance {
        Instance::new(Arc::clone(self), record)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Copy items and temps as plain JSON.
    pub fn snapshot(&self) -> StoreSnapshot {
        let to_map = |entries: Vec<(String, Record)>| -> Record {
            entries
                .into_iter()
                .map(|(key, record)| (key, Value::Object(record)))
                .collect()
        };
        StoreSnapshot {
            items_by_id: to_map(self.items.entries()),
            temps_by_id: to_map(self.temps.storage().entries()),
        }
    }

    /// Load a snapshot into items and temps. Returns how many records loaded.
    ///
    /// Entries that are not objects are skipped.
    pub fn restore(&self, snapshot: StoreSnapshot) -> usize {
        let mut loaded = 0;
        for (tier, map) in [
            (self.items(), snapshot.items_by_id),
            (self.temps(), snapshot.temps_by_id),
        ] {
            for (key, value) in map {
                match value {
                    Value::Object(mut record) => {
                        record.remove(CLONE_FLAG);
                        tier.set_item(&key, record);
                        loaded += 1;
                    }
                    other => warn!(key = %key, value = %other, "skipping non-object snapshot entry"),
                }
            }
        }
        debug!(store = %self.config.name, loaded, "snapshot restored");
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Association, DefaultsModel};
    use crate::types::into_record;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rec(value: Value) -> Record {
        into_record(value).unwrap()
    }

    fn store() -> Arc<Store> {
        Store::local("todos").unwrap()
    }

    fn query(value: Value) -> Params {
        Params::from_query(rec(value))
    }

    #[test]
    fn test_add_routes_by_identity() {
        let store = store();
        store.add_or_update(rec(json!({"id": 1, "text": "saved"}))).unwrap();
        let temp = store.add_or_update(rec(json!({"text": "draft"}))).unwrap();

        assert_eq!(store.items().len(), 1);
        assert_eq!(store.temps().len(), 1);
        assert!(store.identity().temp_id_of(&temp).is_some());
    }

    #[test]
    fn test_identity_exclusivity_after_promotion() {
        let store = store();
        let temp = store.add_or_update(rec(json!({"text": "x"}))).unwrap();
        let temp_id = store.identity().temp_id_of(&temp).unwrap();

        let mut saved = temp.clone();
        saved.insert("id".into(), json!(7));
        store.add_or_update(saved).unwrap();

        assert!(store.temps().is_empty());
        assert_eq!(store.items().ids(), vec!["7"]);
        assert!(!store.temps().has_id(&temp_id));
    }

    #[test]
    fn test_find_in_store_views() {
        let store = store();
        store.add_or_update(rec(json!({"id": 1, "n": 1}))).unwrap();
        store.add_or_update(rec(json!({"n": 2}))).unwrap();
        let mut clone = store.clone_record(&rec(json!({"id": 1})), None, true).unwrap();
        clone.insert("n".into(), json!(10));
        store.save_clone(clone).unwrap();

        let items = store.find_in_store(&query(json!({}))).unwrap();
        assert_eq!(items.total, 1);

        let with_temps = store.find_in_store(&query(json!({})).with_temps()).unwrap();
        assert_eq!(with_temps.total, 2);

        let with_clones = store
            .find_in_store(&query(json!({"n": 10})).with_clones())
            .unwrap();
        assert_eq!(with_clones.total, 1);
        assert!(is_clone(&with_clones.data[0]));

        let items_only = store.find_in_store(&query(json!({"n": 10}))).unwrap();
        assert_eq!(items_only.total, 0);
    }

    #[test]
    fn test_select_does_not_replace_stored_record() {
        let store = store();
        store.add_or_update(rec(json!({"id": 1, "a": 1, "b": 2}))).unwrap();

        let found = store.find_in_store(&query(json!({"$select": ["a"]}))).unwrap();
        assert_eq!(found.data, vec![rec(json!({"id": 1, "a": 1}))]);
        assert_eq!(store.items().get_item("1").unwrap(), rec(json!({"id": 1, "a": 1, "b": 2})));

        let got = store.get_from_store("1", &query(json!({"$select": ["b"]}))).unwrap();
        assert_eq!(got, rec(json!({"id": 1, "b": 2})));
    }

    #[test]
    fn test_get_from_store_priority() {
        let store = store();
        store.add_or_update(rec(json!({"id": 1, "v": "item"}))).unwrap();
        let mut clone = store.clone_record(&rec(json!({"id": 1})), None, true).unwrap();
        clone.insert("v".into(), json!("clone"));
        store.save_clone(clone).unwrap();

        assert_eq!(store.get_from_store("1", &Params::default()).unwrap()["v"], "item");
        assert_eq!(
            store.get_from_store("1", &Params::default().with_clones()).unwrap()["v"],
            "clone"
        );
        assert!(store.get_from_store("404", &Params::default()).is_none());
    }

    #[test]
    fn test_count_requires_query() {
        let store = store();
        store.add_all((1..=5).map(|n| rec(json!({"id": n, "even": n % 2 == 0})))).unwrap();

        assert!(matches!(
            store.count_in_store(&Params::default()),
            Err(StoreError::MissingQuery)
        ));
        let count = store
            .count_in_store(&query(json!({"even": false, "$limit": 1, "$skip": 1})))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_disallowed_operator_is_rejected() {
        let store = store();
        let result = store.find_in_store(&query(json!({"a": {"$regex": ".*"}})));
        assert!(matches!(result, Err(StoreError::DisallowedOperator { .. })));
    }

    #[test]
    fn test_remove_from_store_clears_clone() {
        let store = store();
        let record = store.add_or_update(rec(json!({"id": 3}))).unwrap();
        store.clone_record(&record, None, true).unwrap();

        assert!(store.remove_from_store(&record));
        assert!(store.items().is_empty());
        assert!(store.clones().is_empty());
        assert!(!store.remove_from_store(&record));
    }

    #[test]
    fn test_snapshot_round_trip_into_fresh_store() {
        let store = store();
        store.add_or_update(rec(json!({"id": 1, "a": 1}))).unwrap();
        store.add_or_update(rec(json!({"__tempId": "t", "a": 2}))).unwrap();

        let json = serde_json::to_value(store.snapshot()).unwrap();
        assert!(json.get("itemsById").is_some());
        assert!(json.get("tempsById").is_some());

        let fresh = Store::local("todos").unwrap();
        let loaded = fresh.restore(serde_json::from_value(json).unwrap());
        assert_eq!(loaded, 2);
        assert_eq!(fresh.items().get_item("1").unwrap()["a"], 1);
        assert_eq!(fresh.temps().get_item("t").unwrap()["a"], 2);
    }

    #[test]
    fn test_clear_all() {
        let store = store();
        let record = store.add_or_update(rec(json!({"id": 1}))).unwrap();
        store.add_or_update(rec(json!({"x": 1}))).unwrap();
        store.clone_record(&record, None, true).unwrap();

        store.clear_all();
        assert!(store.items().is_empty());
        assert!(store.temps().is_empty());
        assert!(store.clones().is_empty());
    }

    #[test]
    fn test_model_factory_applies_on_write() {
        let store = StoreBuilder::new(StoreConfig::named("tasks"))
            .model(Arc::new(DefaultsModel::new(rec(json!({"done": false})))))
            .build()
            .unwrap();
        let stored = store.add_or_update(rec(json!({"id": 1}))).unwrap();
        assert_eq!(stored, rec(json!({"id": 1, "done": false})));
    }

    #[test]
    fn test_belongs_to_association() {
        let users = Store::local("users").unwrap();
        let posts = StoreBuilder::new(StoreConfig::named("posts"))
            .associations(Associations::new().define(
                "author",
                Association::belongs_to(Arc::clone(&users), "authorId"),
            ))
            .build()
            .unwrap();

        let post = posts
            .add_or_update(rec(json!({"id": 10, "author": {"id": 2, "name": "ada"}})))
            .unwrap();
        assert_eq!(post, rec(json!({"id": 10, "authorId": 2})));
        assert_eq!(users.items().get_item("2").unwrap()["name"], "ada");
        assert_eq!(
            posts.resolve_association(&post, "author"),
            Some(json!({"id": 2, "name": "ada"}))
        );
    }

    #[test]
    fn test_has_many_association() {
        let comments = Store::local("comments").unwrap();
        comments
            .add_all([
                rec(json!({"id": 1, "postId": 5})),
                rec(json!({"id": 2, "postId": 6})),
                rec(json!({"id": 3, "postId": 5})),
            ])
            .unwrap();
        let posts = StoreBuilder::new(StoreConfig::named("posts"))
            .associations(Associations::new().define(
                "comments",
                Association::has_many(Arc::clone(&comments), |post| {
                    let mut query = Record::new();
                    query.insert("postId".into(), post.get("id").cloned().unwrap_or(Value::Null));
                    Params::from_query(query)
                }),
            ))
            .build()
            .unwrap();

        let post = posts.add_or_update(rec(json!({"id": 5}))).unwrap();
        let related = posts.resolve_association(&post, "comments").unwrap();
        assert_eq!(related.as_array().unwrap().len(), 2);
    }
}
