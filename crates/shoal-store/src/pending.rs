//! Pending-state tracking for in-flight remote calls.
//!
//! Per-record flags cover create/update/patch/remove; find/count/get are
//! tracked as global counters. Flags are advisory for a UI and never block.
//! A [`PendingGuard`] clears its flag when dropped, so every exit path of a
//! remote call (success, error, cancellation) releases it.

use std::fmt;
use std::hash::Hash;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::updates::{StoreUpdate, UpdateSender};

/// Remote operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Find,
    Count,
    Get,
    Create,
    Update,
    Patch,
    Remove,
}

impl Operation {
    /// Whether this kind is tracked by a global counter rather than per id.
    pub fn is_global(self) -> bool {
        matches!(self, Operation::Find | Operation::Count | Operation::Get)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Find => "find",
            Operation::Count => "count",
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Patch => "patch",
            Operation::Remove => "remove",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-flight counts per (record, operation) and per global operation.
pub struct PendingTracker {
    by_id: DashMap<(String, Operation), usize>,
    global: DashMap<Operation, usize>,
    updates: UpdateSender,
}

impl PendingTracker {
    pub fn new(updates: UpdateSender) -> Self {
        Self {
            by_id: DashMap::new(),
            global: DashMap::new(),
            updates,
        }
    }

    /// Mark `operation` as in flight until the returned guard is dropped.
    ///
    /// `id` is ignored for global operations.
    pub fn begin(&self, operation: Operation, id: Option<&str>) -> PendingGuard<'_> {
        let id = if operation.is_global() {
            None
        } else {
            id.map(str::to_string)
        };
        let started = match &id {
            Some(id) => increment(&self.by_id, (id.clone(), operation)),
            None => increment(&self.global, operation),
        };
        if started {
            debug!(operation = %operation, id = ?id, "pending set");
            self.updates.send(StoreUpdate::PendingChanged {
                operation,
                id: id.clone(),
                pending: true,
            });
        }
        PendingGuard {
            tracker: self,
            operation,
            id,
        }
    }

    fn finish(&self, operation: Operation, id: Option<String>) {
        let cleared = match &id {
            Some(id) => decrement(&self.by_id, (id.clone(), operation)),
            None => decrement(&self.global, operation),
        };
        if cleared {
            debug!(operation = %operation, id = ?id, "pending cleared");
            self.updates.send(StoreUpdate::PendingChanged {
                operation,
                id,
                pending: false,
            });
        }
    }

    /// Whether `operation` is in flight for record `id`.
    pub fn is_pending(&self, operation: Operation, id: &str) -> bool {
        self.by_id.contains_key(&(id.to_string(), operation))
    }

    /// Whether any mutation is in flight for record `id`.
    pub fn is_any_pending(&self, id: &str) -> bool {
        [
            Operation::Create,
            Operation::Update,
            Operation::Patch,
            Operation::Remove,
        ]
        .into_iter()
        .any(|operation| self.is_pending(operation, id))
    }

    /// Number of in-flight calls of a global operation kind.
    pub fn in_flight(&self, operation: Operation) -> usize {
        self.global.get(&operation).map(|n| *n).unwrap_or(0)
    }

    /// Forget all pending state.
    pub fn clear(&self) {
        self.by_id.clear();
        self.global.clear();
    }
}

fn increment<K: Eq + Hash>(map: &DashMap<K, usize>, key: K) -> bool {
    let mut count = map.entry(key).or_insert(0);
    *count += 1;
    *count == 1
}

fn decrement<K: Eq + Hash>(map: &DashMap<K, usize>, key: K) -> bool {
    match map.entry(key) {
        Entry::Occupied(mut entry) => {
            if *entry.get() <= 1 {
                entry.remove();
                true
            } else {
                *entry.get_mut() -= 1;
                false
            }
        }
        Entry::Vacant(_) => false,
    }
}

/// Clears a pending flag on drop.
#[must_use = "the pending flag is cleared as soon as the guard is dropped"]
pub struct PendingGuard<'a> {
    tracker: &'a PendingTracker,
    operation: Operation,
    id: Option<String>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.tracker.finish(self.operation, self.id.take());
    }
}
