//! Remote record service boundary.
//!
//! The store never talks to a transport directly; it calls a
//! [`RemoteService`] and listens to its [`ServiceEvent`] stream.
//! [`MemoryService`] is an in-process implementation backed by the same
//! storage and query code the store uses locally.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::error::ServiceError;
use crate::identity::Identity;
use crate::model::Model;
use crate::pending::Operation;
use crate::query::{OperatorPolicy, QueryEngine};
use crate::storage::{KeySource, StorageMap, Tier};
use crate::types::{FindResponse, Params, Record};
use crate::updates::UpdateSender;

/// Capacity of the service event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Boundary types
// =============================================================================

/// Kind of a live change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Created,
    Updated,
    Patched,
    Removed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Patched => "patched",
            EventKind::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// A change notification carrying the affected record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub kind: EventKind,
    pub record: Record,
}

impl ServiceEvent {
    pub fn new(kind: EventKind, record: Record) -> Self {
        Self { kind, record }
    }
}

/// One page of a paginated find.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemotePage {
    pub total: usize,
    pub limit: usize,
    pub skip: usize,
    pub data: Vec<Record>,
}

/// What a service returns from `find`.
#[derive(Debug, Clone, PartialEq)]
pub enum FindResult {
    /// A paginated response with metadata.
    Page(RemotePage),
    /// Every match, without paging metadata.
    All(Vec<Record>),
}

impl FindResult {
    pub fn data(&self) -> &[Record] {
        match self {
            FindResult::Page(page) => &page.data,
            FindResult::All(data) => data,
        }
    }

    pub fn is_paginated(&self) -> bool {
        matches!(self, FindResult::Page(_))
    }

    /// Convert into the store's response shape.
    pub fn into_response(self) -> FindResponse {
        match self {
            FindResult::Page(page) => FindResponse {
                total: page.total,
                limit: page.limit,
                skip: page.skip,
                data: page.data,
            },
            FindResult::All(data) => FindResponse {
                total: data.len(),
                limit: 0,
                skip: 0,
                data,
            },
        }
    }
}

/// A remote record service.
///
/// `id` arguments are normalized identity keys.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn find(&self, params: &Params) -> Result<FindResult, ServiceError>;

    async fn get(&self, id: &str, params: &Params) -> Result<Record, ServiceError>;

    async fn create(&self, data: Record, params: &Params) -> Result<Record, ServiceError>;

    async fn update(&self, id: &str, data: Record, params: &Params)
    -> Result<Record, ServiceError>;

    async fn patch(&self, id: &str, data: Record, params: &Params) -> Result<Record, ServiceError>;

    async fn remove(&self, id: &str, params: &Params) -> Result<Record, ServiceError>;

    /// Live change notifications, if the service publishes them.
    fn subscribe(&self) -> Option<broadcast::Receiver<ServiceEvent>> {
        None
    }
}

// =============================================================================
// In-memory service
// =============================================================================

/// Page size settings for a paginated [`MemoryService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paginate {
    pub default: usize,
    pub max: usize,
}

/// In-process record service.
///
/// Assigns auto-incrementing numeric ids, evaluates queries with every
/// locally supported operator, and publishes an event for each mutation.
pub struct MemoryService {
    identity: Arc<Identity>,
    records: StorageMap,
    next_id: AtomicU64,
    engine: QueryEngine,
    paginate: Option<Paginate>,
    latency: Option<Duration>,
    events: broadcast::Sender<ServiceEvent>,
    failures: DashMap<Operation, ServiceError>,
    calls: DashMap<Operation, usize>,
}

impl Default for MemoryService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryService {
    /// An empty, unpaginated service keyed by `id`.
    pub fn new() -> Self {
        Self::with_identity(Identity::new("id", None, "__tempId"))
    }

    pub fn with_identity(identity: Identity) -> Self {
        let identity = Arc::new(identity);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: StorageMap::new(
                Tier::Items,
                KeySource::Id,
                Arc::clone(&identity),
                Arc::new(Model::default()),
                UpdateSender::new(),
            ),
            engine: QueryEngine::new(Arc::clone(&identity), OperatorPolicy::permissive(), Vec::new()),
            identity,
            next_id: AtomicU64::new(1),
            paginate: None,
            latency: None,
            events,
            failures: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    /// Paginate find responses.
    pub fn paginated(mut self, default: usize, max: usize) -> Self {
        self.paginate = Some(Paginate { default, max });
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Insert records without emitting events. Records lacking an id get one.
    pub fn seed(&self, records: impl IntoIterator<Item = Record>) {
        for record in records {
            if let Err(e) = self.insert(record) {
                warn!(error = %e, "skipping seed record");
            }
        }
    }

    /// Make the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: Operation, error: ServiceError) {
        self.failures.insert(operation, error);
    }

    /// How many times `operation` has been called.
    pub fn calls(&self, operation: Operation) -> usize {
        self.calls.get(&operation).map(|n| *n).unwrap_or(0)
    }

    /// Every stored record in insertion order.
    pub fn records(&self) -> Vec<Record> {
        self.records.list()
    }

    /// Publish an event as if another client had made the change.
    pub fn emit(&self, kind: EventKind, record: Record) {
        if self.events.receiver_count() == 0 {
            return;
        }
        if self.events.send(ServiceEvent::new(kind, record)).is_err() {
            trace!("no subscribers for service event");
        }
    }

    /// Store `record`, assigning the next numeric id when it has none.
    ///
    /// `u64::MAX` is never assigned; once the counter reaches it, creates
    /// without an id are rejected.
    fn insert(&self, mut record: Record) -> Result<Record, ServiceError> {
        let id = match self.identity.id_of(&record) {
            Some(id) => {
                if let Ok(numeric) = id.parse::<u64>() {
                    self.next_id.fetch_max(numeric.saturating_add(1), Ordering::SeqCst);
                }
                id
            }
            None => {
                let id = self
                    .next_id
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
                    .map_err(|_| ServiceError::BadRequest("numeric id space exhausted".into()))?;
                record.insert(self.identity.id_field().to_string(), Value::from(id));
                id.to_string()
            }
        };
        Ok(self.records.set_item(&id, record))
    }

    async fn enter(&self, operation: Operation) -> Result<(), ServiceError> {
        *self.calls.entry(operation).or_insert(0) += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match self.failures.remove(&operation) {
            Some((_, error)) => {
                debug!(operation = %operation, error = %error, "injected failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn existing(&self, id: &str) -> Result<Record, ServiceError> {
        self.records
            .get_item(id)
            .ok_or_else(|| ServiceError::NotFound { id: id.to_string() })
    }

    fn restore_id(&self, data: &mut Record, existing: &Record) {
        let field = self.identity.id_field();
        if let Some(id) = existing.get(field) {
            data.insert(field.to_string(), id.clone());
        }
    }
}

#[async_trait]
impl RemoteService for MemoryService {
    async fn find(&self, params: &Params) -> Result<FindResult, ServiceError> {
        self.enter(Operation::Find).await?;
        let query = params.query.clone().unwrap_or_default();
        let mut plan = self
            .engine
            .plan(&query)
            .map_err(|e| ServiceError::BadRequest(e.to_string()))?;

        match self.paginate {
            Some(paginate) => {
                let limit = plan.limit.unwrap_or(paginate.default).min(paginate.max);
                plan.limit = Some(limit);
                let response = self.engine.run(&plan, self.records.list());
                Ok(FindResult::Page(RemotePage {
                    total: response.total,
                    limit: response.limit,
                    skip: response.skip,
                    data: response.data,
                }))
            }
            None => Ok(FindResult::All(self.engine.run(&plan, self.records.list()).data)),
        }
    }

    async fn get(&self, id: &str, _params: &Params) -> Result<Record, ServiceError> {
        self.enter(Operation::Get).await?;
        self.existing(id)
    }

    async fn create(&self, data: Record, _params: &Params) -> Result<Record, ServiceError> {
        self.enter(Operation::Create).await?;
        let created = self.insert(data)?;
        self.emit(EventKind::Created, created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        id: &str,
        mut data: Record,
        _params: &Params,
    ) -> Result<Record, ServiceError> {
        self.enter(Operation::Update).await?;
        let existing = self.existing(id)?;
        self.restore_id(&mut data, &existing);
        let updated = self.records.set_item(id, data);
        self.emit(EventKind::Updated, updated.clone());
        Ok(updated)
    }

    async fn patch(
        &self,
        id: &str,
        mut data: Record,
        _params: &Params,
    ) -> Result<Record, ServiceError> {
        self.enter(Operation::Patch).await?;
        let existing = self.existing(id)?;
        self.restore_id(&mut data, &existing);
        let patched = self.records.merge_item(id, data);
        self.emit(EventKind::Patched, patched.clone());
        Ok(patched)
    }

    async fn remove(&self, id: &str, _params: &Params) -> Result<Record, ServiceError> {
        self.enter(Operation::Remove).await?;
        let existing = self.existing(id)?;
        self.records.remove_item(id);
        self.emit(EventKind::Removed, existing.clone());
        Ok(existing)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ServiceEvent>> {
        Some(self.events.subscribe())
    }
}
