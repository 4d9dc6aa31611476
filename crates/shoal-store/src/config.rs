//! Store configuration.
//!
//! Everything here is plain data loadable from JSON. Runtime collaborators
//! (service, model, associations, event filter) are attached through
//! [`StoreBuilder`](crate::StoreBuilder).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::ConfigError;
use crate::events::DebounceConfig;
use crate::identity::Identity;
use crate::query::OperatorPolicy;

/// Recognized store options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Store name, used as the registry key and in log fields.
    pub name: String,
    /// Permanent id field.
    pub id_field: String,
    /// Fallback id field consulted when `id_field` is absent.
    pub alt_id_field: Option<String>,
    /// Temp id field.
    pub temp_id_field: String,
    /// Extra query operators permitted locally.
    pub whitelist: Vec<String>,
    /// Query keys meaningful only to the remote service.
    pub params_for_server: Vec<String>,
    /// Debounce window for live events, in milliseconds.
    pub debounce_events_time: Option<u64>,
    /// Longest a queued live event may wait, in milliseconds.
    pub debounce_events_max_wait: Option<u64>,
    /// Serve `get` from storage without a request when the record is present.
    pub skip_request_if_exists: bool,
    /// Flag recorded find pages as server-rendered.
    pub ssr: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "records".to_string(),
            id_field: "id".to_string(),
            alt_id_field: Some("_id".to_string()),
            temp_id_field: "__tempId".to_string(),
            whitelist: Vec::new(),
            params_for_server: Vec::new(),
            debounce_events_time: None,
            debounce_events_max_wait: None,
            skip_request_if_exists: false,
            ssr: false,
        }
    }
}

impl StoreConfig {
    /// Config with the given store name and defaults elsewhere.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load and validate a JSON config file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&content)
    }

    /// Parse and validate a JSON config document.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_field.is_empty() || self.temp_id_field.is_empty() {
            return Err(ConfigError::Invalid(
                "idField and tempIdField must be non-empty".to_string(),
            ));
        }
        if self.id_field == self.temp_id_field {
            return Err(ConfigError::Invalid(format!(
                "idField and tempIdField are both `{}`",
                self.id_field
            )));
        }
        if let Some(bad) = self.whitelist.iter().find(|op| !op.starts_with('$')) {
            return Err(ConfigError::Invalid(format!(
                "whitelist entry `{bad}` is not an operator"
            )));
        }
        Ok(())
    }

    pub fn identity(&self) -> Identity {
        Identity::new(
            self.id_field.clone(),
            self.alt_id_field.clone(),
            self.temp_id_field.clone(),
        )
    }

    pub fn operator_policy(&self) -> OperatorPolicy {
        OperatorPolicy::new(self.whitelist.iter().cloned())
    }

    /// The coalescing window, if live events are debounced.
    pub fn debounce(&self) -> Option<DebounceConfig> {
        let time = self.debounce_events_time.filter(|ms| *ms > 0)?;
        Some(DebounceConfig {
            time: Duration::from_millis(time),
            max_wait: self.debounce_events_max_wait.map(Duration::from_millis),
        })
    }
}
