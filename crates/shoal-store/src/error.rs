//! Error types for the record store.

use thiserror::Error;

/// Errors reported by a [`RemoteService`](crate::RemoteService) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The service has no record with this id.
    #[error("record not found: {id}")]
    NotFound { id: String },

    /// The service rejected the request payload or parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The call failed in transit (connection, timeout, unexpected response).
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A storage mutation was attempted on a record with no resolvable id.
    #[error("record has no resolvable identity (looked for `{field}`)")]
    InvalidIdentity { field: String },

    /// `commit` was called on a record that is not a clone.
    #[error("record is not a clone")]
    NotAClone,

    /// `count_in_store` was called without a query object.
    #[error("count requires a query object")]
    MissingQuery,

    /// The query used an operator outside the base set and the whitelist.
    #[error("query operator `{operator}` is not allowed")]
    DisallowedOperator { operator: String },

    /// The operator is whitelisted but cannot be evaluated locally.
    #[error("query operator `{operator}` is whitelisted but not supported by the local matcher")]
    UnsupportedOperator { operator: String },

    /// A query directive or operand had the wrong shape.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A remote operation was requested on a store built without a service.
    #[error("store `{store}` has no remote service")]
    NoService { store: String },

    /// The remote service call failed.
    #[error("remote operation failed: {0}")]
    Remote(#[from] ServiceError),
}

impl StoreError {
    /// Whether this error is a remote `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Remote(ServiceError::NotFound { .. }))
    }

    pub(crate) fn invalid_identity(field: &str) -> Self {
        StoreError::InvalidIdentity {
            field: field.to_string(),
        }
    }
}

/// Errors loading a [`StoreConfig`](crate::StoreConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("a store named `{name}` is already registered")]
    DuplicateStore { name: String },
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
