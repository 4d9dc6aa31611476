//! Remote operations: pending tracking, optimistic patches and reconciliation.
//!
//! Every remote call holds a [`PendingGuard`](crate::pending::PendingGuard)
//! for its duration. Storage effects for create/update/remove are applied
//! only after the service succeeds; a patch of a clone is applied eagerly and
//! rolled back to a snapshot taken at its start if the service fails.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, StoreError};
use crate::events::Change;
use crate::pending::Operation;
use crate::query::values_equal;
use crate::service::{FindResult, RemoteService, ServiceEvent};
use crate::store::Store;
use crate::types::{CLONE_FLAG, FindResponse, Params, Record, is_clone};

/// How a patch payload is derived from a clone.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Diff {
    /// Every field of the clone that differs from the canonical record.
    #[default]
    All,
    /// Only the named fields, when they differ.
    Fields(Vec<String>),
    /// The given values, where they differ from the canonical record.
    Values(Record),
    /// Send the whole clone.
    Disabled,
}

/// Options for [`Store::patch`].
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOptions {
    pub params: Params,
    pub diff: Diff,
    /// Fields always sent, changed or not.
    pub with: Vec<String>,
    /// Apply the diff to the canonical record before the call resolves.
    pub eager: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            params: Params::default(),
            diff: Diff::All,
            with: Vec::new(),
            eager: true,
        }
    }
}

impl PatchOptions {
    pub fn diff(mut self, diff: Diff) -> Self {
        self.diff = diff;
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn lazy(mut self) -> Self {
        self.eager = false;
        self
    }
}

impl Store {
    fn remote(&self) -> Result<&Arc<dyn RemoteService>> {
        self.service.as_ref().ok_or_else(|| StoreError::NoService {
            store: self.config.name.clone(),
        })
    }

    /// Copy of `record` without clone and temp-id markers.
    fn outgoing(&self, record: &Record) -> Record {
        let mut payload = record.clone();
        payload.remove(CLONE_FLAG);
        self.identity.strip_temp_id(&mut payload);
        payload
    }

    /// Fetch from the service, store the results and record the page.
    ///
    /// A cached page flagged as server-rendered is served once without a
    /// request (and stays flagged with `params.preserve_ssr`).
    #[tracing::instrument(skip(self, params), fields(store = %self.config.name, qid = ?params.qid))]
    pub async fn find(&self, params: &Params) -> Result<FindResponse> {
        if let Some(cached) = self.ledger.cached_page(params)
            && cached.entry.ssr
            && let Some(response) = self.find_cached(params)
        {
            if !params.preserve_ssr {
                self.ledger.take_ssr(
                    &cached.info.qid,
                    &cached.info.query_id,
                    cached.info.page_id.as_deref(),
                );
            }
            debug!("served ssr page from ledger");
            return Ok(response);
        }

        let service = self.remote()?;
        let _pending = self.pending.begin(Operation::Find, None);
        let result = service.find(params).await.inspect_err(|e| {
            warn!(error = %e, "remote find failed");
        })?;

        let stored = self.add_all(result.data().iter().cloned())?;
        self.ledger
            .record_page(params, &result, &self.identity, self.config.ssr);

        let mut response = result.into_response();
        response.data = stored;
        Ok(response)
    }

    /// Rebuild a previously fetched page from storage.
    ///
    /// `None` unless the ledger has the page and every id on it is stored.
    pub fn find_cached(&self, params: &Params) -> Option<FindResponse> {
        let cached = self.ledger.cached_page(params)?;
        let mut data = Vec::with_capacity(cached.entry.ids.len());
        for id in &cached.entry.ids {
            let record = self.canonical().origin_by_key(id)?;
            data.push(if params.clones {
                self.prefer_clone(record)
            } else {
                record
            });
        }
        let (limit, skip) = cached
            .entry
            .page_params
            .map(|p| (p.limit, p.skip.unwrap_or(0)))
            .unwrap_or((0, 0));
        Some(FindResponse {
            total: cached.total,
            limit,
            skip,
            data,
        })
    }

    /// Count matching records on the service.
    #[tracing::instrument(skip(self, params), fields(store = %self.config.name))]
    pub async fn count(&self, params: &Params) -> Result<usize> {
        let service = self.remote()?;
        let query = params.query.clone().unwrap_or_default();
        let params = params.with_query(crate::query::strip_paging(&query));

        let _pending = self.pending.begin(Operation::Count, None);
        let result = service.find(&params).await.inspect_err(|e| {
            warn!(error = %e, "remote count failed");
        })?;
        self.add_all(result.data().iter().cloned())?;
        Ok(match &result {
            FindResult::Page(page) => page.total,
            FindResult::All(data) => data.len(),
        })
    }

    /// Fetch one record and store it.
    ///
    /// With `skipRequestIfExists`, a stored record is returned without a call.
    #[tracing::instrument(skip(self, params), fields(store = %self.config.name))]
    pub async fn get(&self, id: &str, params: &Params) -> Result<Record> {
        if self.config.skip_request_if_exists
            && let Some(existing) = self.get_from_store(id, &Params::default())
        {
            trace!("get served from storage");
            return Ok(existing);
        }

        let service = self.remote()?;
        let _pending = self.pending.begin(Operation::Get, Some(id));
        let record = service.get(id, params).await.inspect_err(|e| {
            warn!(error = %e, "remote get failed");
        })?;
        self.add_or_update(record)
    }

    /// Create `record` on the service and reconcile the response.
    ///
    /// The temp id is stripped before sending and re-attached to the
    /// response so the temp entry (and any clone of it) moves to the
    /// permanent id.
    #[tracing::instrument(skip_all, fields(store = %self.config.name))]
    pub async fn create(&self, record: &Record, params: &Params) -> Result<Record> {
        let service = self.remote()?;
        let temp_id = self.identity.temp_id_of(record);
        let pending_key = self.identity.any_id_of(record);

        let _pending = self.pending.begin(Operation::Create, pending_key.as_deref());
        let mut created = service
            .create(self.outgoing(record), params)
            .await
            .inspect_err(|e| {
                warn!(error = %e, "remote create failed");
            })?;

        let Some(temp_id) = temp_id else {
            return self.add_or_update(created);
        };
        created.insert(
            self.identity.temp_id_field().to_string(),
            Value::String(temp_id.clone()),
        );
        let stored = self.temps.move_to_permanent(&mut created, &self.items)?;

        if let Some(id) = self.identity.id_of(&stored) {
            let id_value = stored
                .get(self.identity.id_field())
                .cloned()
                .unwrap_or_else(|| Value::String(id.clone()));
            if self.clones.migrate(&temp_id, &id, &id_value).is_some() {
                debug!(temp_id = %temp_id, id = %id, "clone moved to permanent id");
            }
            info!(temp_id = %temp_id, id = %id, "created");
        }
        Ok(stored)
    }

    /// Replace a record on the service and store the response.
    ///
    /// The response replaces the stored record wholesale, so local-only
    /// fields absent from the response are dropped. Use
    /// [`patch`](Self::patch) to merge.
    #[tracing::instrument(skip(self, data, params), fields(store = %self.config.name))]
    pub async fn update(&self, id: &str, data: &Record, params: &Params) -> Result<Record> {
        let service = self.remote()?;
        let _pending = self.pending.begin(Operation::Update, Some(id));
        let updated = service
            .update(id, self.outgoing(data), params)
            .await
            .inspect_err(|e| {
                warn!(error = %e, "remote update failed");
            })?;
        self.canonical().replace(updated)
    }

    /// Patch a record on the service.
    ///
    /// For a clone, the payload is the diff against the canonical record per
    /// `options.diff`; an empty diff returns the clone without a call. With
    /// `options.eager` the diff is committed before the call and rolled back
    /// if it fails. The clone keeps its edits either way.
    #[tracing::instrument(skip(self, data, options), fields(store = %self.config.name))]
    pub async fn patch(&self, id: &str, data: &Record, options: &PatchOptions) -> Result<Record> {
        let service = self.remote()?;
        let _pending = self.pending.begin(Operation::Patch, Some(id));
        let origin = self.items.get_item(id);

        let payload = if is_clone(data) && options.diff != Diff::Disabled {
            let mut diff = self.diff_against(data, origin.as_ref(), &options.diff);
            if diff.is_empty() {
                trace!("empty diff, skipping patch");
                return Ok(data.clone());
            }
            for field in &options.with {
                if let Some(value) = data.get(field) {
                    diff.insert(field.clone(), value.clone());
                }
            }
            diff
        } else {
            self.outgoing(data)
        };

        let rollback = match origin {
            Some(snapshot) if options.eager && is_clone(data) => {
                self.items.merge_item(id, payload.clone());
                Some(snapshot)
            }
            _ => None,
        };

        match service.patch(id, payload, &options.params).await {
            Ok(patched) => self.add_or_update(patched),
            Err(e) => {
                if let Some(snapshot) = rollback {
                    warn!(error = %e, "patch failed, rolling back eager update");
                    self.items.set_item(id, snapshot);
                } else {
                    warn!(error = %e, "remote patch failed");
                }
                Err(e.into())
            }
        }
    }

    fn diff_against(&self, clone: &Record, origin: Option<&Record>, diff: &Diff) -> Record {
        let candidates: Vec<(&String, &Value)> = match diff {
            Diff::All | Diff::Disabled => clone.iter().collect(),
            Diff::Fields(fields) => clone.iter().filter(|(k, _)| fields.contains(k)).collect(),
            Diff::Values(values) => values.iter().collect(),
        };
        candidates
            .into_iter()
            .filter(|(key, _)| {
                key.as_str() != CLONE_FLAG && key.as_str() != self.identity.temp_id_field()
            })
            .filter(|(key, value)| {
                origin
                    .and_then(|o| o.get(key.as_str()))
                    .is_none_or(|current| !values_equal(current, value))
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Remove a record on the service, then from every tier.
    ///
    /// A record that exists only as a temp is removed locally without a call.
    #[tracing::instrument(skip(self, params), fields(store = %self.config.name))]
    pub async fn remove(&self, id: &str, params: &Params) -> Result<Option<Record>> {
        if !self.items.has_id(id)
            && let Some(temp) = self.temps.storage().get_item(id)
        {
            self.remove_from_store(&temp);
            debug!("removed unsaved temp locally");
            return Ok(Some(temp));
        }

        let service = self.remote()?;
        let _pending = self.pending.begin(Operation::Remove, Some(id));
        let removed = service.remove(id, params).await.inspect_err(|e| {
            warn!(error = %e, "remote remove failed");
        })?;
        self.remove_from_store(&removed);
        self.remove_by_key(id);
        Ok(Some(removed))
    }

    // =========================================================================
    // Live events
    // =========================================================================

    /// Apply (or queue, when debounced) one live event.
    pub async fn handle_event(&self, event: ServiceEvent) {
        if let Some(filter) = &self.event_filter
            && !filter(event.kind, &event.record)
        {
            trace!(kind = %event.kind, "event rejected by filter");
            return;
        }
        let Some(key) = self.identity.any_id_of(&event.record) else {
            warn!(kind = %event.kind, "ignoring event for record without identity");
            return;
        };

        match &self.events {
            Some(queue) => {
                if queue.push(key, Change::from(event)).await {
                    self.schedule_flush();
                }
            }
            None => self.apply_change(Change::from(event)),
        }
    }

    /// Spawn a timer that flushes the queue once its deadline passes.
    ///
    /// The deadline moves while events keep arriving, so the timer re-reads
    /// it after every sleep.
    fn schedule_flush(&self) {
        let Some(store) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let Some(queue) = &store.events else {
                return;
            };
            while let Some(deadline) = queue.deadline().await {
                if Instant::now() >= deadline {
                    store.flush_events().await;
                    break;
                }
                tokio::time::sleep_until(deadline).await;
            }
        });
    }

    /// Apply every queued event now. Returns how many changes were applied.
    pub async fn flush_events(&self) -> usize {
        let Some(queue) = &self.events else {
            return 0;
        };
        let changes = queue.drain().await;
        let count = changes.len();
        for change in changes {
            self.apply_change(change);
        }
        if count > 0 {
            debug!(store = %self.config.name, count, "flushed queued events");
        }
        count
    }

    fn apply_change(&self, change: Change) {
        match change {
            Change::Upsert(record) => {
                if let Err(e) = self.add_or_update(record) {
                    warn!(error = %e, "failed to apply live event");
                }
            }
            Change::Remove(record) => {
                self.remove_from_store(&record);
            }
        }
    }

    /// Spawn a task applying the service's live events until shutdown.
    ///
    /// Returns `None` when the store has no service or the service publishes
    /// no events. Queued events are flushed once more on shutdown.
    pub fn start_event_listener(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let mut rx = self.service.as_ref()?.subscribe()?;
        let store = Arc::clone(self);

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(store = %store.config.name, "event listener received shutdown signal");
                            break;
                        }
                    }
                    event = rx.recv() => match event {
                        Ok(event) => store.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "event listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("service event stream closed, stopping listener");
                            break;
                        }
                    },
                }
            }
            store.flush_events().await;
        }))
    }
}
