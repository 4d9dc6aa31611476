//! Live-event coalescing.
//!
//! With a debounce window configured, service events are queued per record
//! identity instead of being applied at once. A later event for the same
//! identity replaces the queued one, so an `updated` after `created` keeps
//! only the newest payload and a `removed` cancels a queued add (and vice
//! versa). The queue is flushed when the window has been quiet for
//! `time`, or at the latest `max_wait` after the first queued event. The
//! first push into an empty queue arms the flush timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::service::{EventKind, ServiceEvent};
use crate::types::Record;

// Stand-in for an unreachable deadline, same horizon as tokio's timers.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `at + wait`, falling back to [`FAR_FUTURE`] on overflow.
fn after(at: Instant, wait: Duration) -> Instant {
    at.checked_add(wait).unwrap_or_else(|| at + FAR_FUTURE)
}

/// Predicate deciding whether a live event is applied.
pub type EventFilter = Arc<dyn Fn(EventKind, &Record) -> bool + Send + Sync>;

/// Event coalescing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Quiet period after the last event before flushing.
    pub time: Duration,
    /// Upper bound on how long the first queued event may wait.
    pub max_wait: Option<Duration>,
}

/// The storage effect of one or more coalesced events.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Upsert(Record),
    Remove(Record),
}

impl From<ServiceEvent> for Change {
    fn from(event: ServiceEvent) -> Self {
        match event.kind {
            EventKind::Removed => Change::Remove(event.record),
            EventKind::Created | EventKind::Updated | EventKind::Patched => {
                Change::Upsert(event.record)
            }
        }
    }
}

#[derive(Default)]
struct QueueState {
    changes: HashMap<String, (u64, Change)>,
    next_seq: u64,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
}

/// Per-identity queue of changes awaiting a flush.
pub struct EventQueue {
    config: DebounceConfig,
    state: Mutex<QueueState>,
}

impl EventQueue {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn config(&self) -> DebounceConfig {
        self.config
    }

    /// Queue `change` for `key`, replacing any change already queued for it.
    ///
    /// Returns `true` when the queue was empty, meaning the caller owns
    /// scheduling the next flush.
    pub async fn push(&self, key: String, change: Change) -> bool {
        let mut state = self.state.lock().await;
        let arm = state.changes.is_empty();
        let now = Instant::now();
        state.first_at.get_or_insert(now);
        state.last_at = Some(now);
        let seq = state.next_seq;
        state.next_seq += 1;
        if state.changes.insert(key.clone(), (seq, change)).is_some() {
            trace!(key = %key, "coalesced queued event");
        }
        arm
    }

    /// When the queued changes are due, or `None` when the queue is empty.
    pub async fn deadline(&self) -> Option<Instant> {
        let state = self.state.lock().await;
        let (first, last) = (state.first_at?, state.last_at?);
        let quiet = after(last, self.config.time);
        Some(match self.config.max_wait {
            Some(max_wait) => quiet.min(after(first, max_wait)),
            None => quiet,
        })
    }

    /// Take every queued change in arrival order of its latest event.
    pub async fn drain(&self) -> Vec<Change> {
        let mut state = self.state.lock().await;
        state.first_at = None;
        state.last_at = None;
        let mut queued: Vec<(u64, Change)> = state.changes.drain().map(|(_, v)| v).collect();
        queued.sort_by_key(|(seq, _)| *seq);
        queued.into_iter().map(|(_, change)| change).collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.changes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
