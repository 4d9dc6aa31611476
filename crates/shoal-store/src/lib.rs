//! Normalized client-side record cache for remote services.
//!
//! Records fetched from a [`RemoteService`] are stored once per identity and
//! shared by every query that returns them. Local queries run against the
//! cache with a MongoDB-style filter language.
//!
//! ## Features
//!
//! - **Storage**: items, temps (unsaved records) and clones (editable drafts)
//! - **Queries**: filter, sort, paginate and project stored records
//! - **Pagination**: a ledger of which ids each fetched page returned
//! - **Mutations**: pending flags, optimistic patches with rollback and
//!   temp-to-permanent migration on create
//! - **Events**: live service events, optionally debounced

mod clones;
pub mod config;
mod error;
pub mod events;
pub mod identity;
mod instance;
pub mod model;
mod orchestrator;
pub mod pagination;
pub mod pending;
pub mod query;
mod registry;
pub mod service;
pub mod storage;
mod store;
mod temps;
mod types;
mod updates;

pub use config::StoreConfig;
pub use error::{ConfigError, Result, ServiceError, StoreError};
pub use events::{Change, DebounceConfig, EventFilter};
pub use identity::{DEFAULT_QID, Identity, PageParams, QueryInfo, fingerprint, fingerprint_record};
pub use instance::Instance;
pub use model::{Association, Associations, DefaultsModel, Model, ModelFactory, PlainModel};
pub use orchestrator::{Diff, PatchOptions};
pub use pagination::{CachedPage, PageEntry, PaginationLedger, QueryEntry};
pub use pending::{Operation, PendingGuard, PendingTracker};
pub use query::{Filter, OperatorPolicy, QueryEngine, QueryPlan, SortKey};
pub use registry::StoreRegistry;
pub use service::{
    EventKind, FindResult, MemoryService, Paginate, RemotePage, RemoteService, ServiceEvent,
};
pub use storage::{StorageMap, Tier};
pub use store::{Store, StoreBuilder, StoreSnapshot};
pub use types::{CLONE_FLAG, FindResponse, Params, Record, into_record, is_clone};
pub use updates::StoreUpdate;
