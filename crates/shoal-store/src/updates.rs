//! Change notifications pushed to store subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::pending::Operation;
use crate::storage::Tier;
use crate::types::Record;

/// Broadcast channel capacity for store updates.
/// Sized for a burst of a few thousand records from a single find response.
pub const UPDATE_CHANNEL_CAPACITY: usize = 4096;

/// Update event for store subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreUpdate {
    /// A record was written to a tier.
    Stored { tier: Tier, id: String, record: Record },
    /// A record was removed from a tier.
    Removed { tier: Tier, id: String },
    /// A tier was emptied.
    Cleared { tier: Tier },
    /// A temp was promoted to a permanent item.
    TempMigrated { temp_id: String, id: String },
    /// A pending flag or counter changed.
    PendingChanged {
        operation: Operation,
        id: Option<String>,
        pending: bool,
    },
    /// A find response was recorded in the pagination ledger.
    PageRecorded {
        qid: String,
        query_id: String,
        page_id: Option<String>,
    },
}

/// Sending half of the update channel, shared by every store component.
#[derive(Debug, Clone)]
pub struct UpdateSender {
    tx: broadcast::Sender<StoreUpdate>,
}

impl Default for UpdateSender {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateSender {
    /// Create a new channel.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to updates.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.tx.subscribe()
    }

    /// Send an update. Having no subscribers is not an error.
    pub fn send(&self, update: StoreUpdate) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        if self.tx.send(update).is_err() {
            trace!("no subscribers for store update");
        }
    }
}
