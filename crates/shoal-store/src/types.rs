//! Shared value types: records, call parameters, find responses.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An application record: a plain keyed JSON object.
pub type Record = Map<String, Value>;

/// Field marking records that live in the clone registry.
pub const CLONE_FLAG: &str = "__isClone";

/// Convert a JSON value into a record, if it is an object.
pub fn into_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Whether the record carries `__isClone: true`.
pub fn is_clone(record: &Record) -> bool {
    matches!(record.get(CLONE_FLAG), Some(Value::Bool(true)))
}

/// Parameters for local and remote find/get/count calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Params {
    /// Filter, sort and paging directives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Record>,
    /// Include temps in local reads.
    #[serde(default)]
    pub temps: bool,
    /// Prefer clones in local reads.
    #[serde(default)]
    pub clones: bool,
    /// Query identifier grouping pagination ledger entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qid: Option<String>,
    /// Keep the SSR flag of a consumed ledger page.
    #[serde(default)]
    pub preserve_ssr: bool,
}

impl Params {
    /// Params with the given query object.
    pub fn from_query(query: Record) -> Self {
        Self {
            query: Some(query),
            ..Self::default()
        }
    }

    /// Include temps in local reads.
    pub fn with_temps(mut self) -> Self {
        self.temps = true;
        self
    }

    /// Prefer clones in local reads.
    pub fn with_clones(mut self) -> Self {
        self.clones = true;
        self
    }

    /// Set the query identifier.
    pub fn with_qid(mut self, qid: impl Into<String>) -> Self {
        self.qid = Some(qid.into());
        self
    }

    /// Preserve the SSR flag when a ledger page is consumed.
    pub fn preserving_ssr(mut self) -> Self {
        self.preserve_ssr = true;
        self
    }

    /// Copy of these params with a different query.
    pub fn with_query(&self, query: Record) -> Self {
        Self {
            query: Some(query),
            ..self.clone()
        }
    }
}

/// Result of a find, local or remote.
///
/// `limit` and `skip` are always present and default to 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindResponse {
    pub total: usize,
    pub limit: usize,
    pub skip: usize,
    pub data: Vec<Record>,
}

/// Read a non-negative count from a `$limit`/`$skip` style directive.
///
/// Accepts JSON numbers and numeric strings (query strings arrive as text).
pub(crate) fn as_count(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_record() {
        assert!(into_record(json!({"a": 1})).is_some());
        assert!(into_record(json!([1, 2])).is_none());
        assert!(into_record(Value::Null).is_none());
    }

    #[test]
    fn test_is_clone() {
        let clone = into_record(json!({"id": 1, "__isClone": true})).unwrap();
        let committed = into_record(json!({"id": 1, "__isClone": false})).unwrap();
        let plain = into_record(json!({"id": 1})).unwrap();
        assert!(is_clone(&clone));
        assert!(!is_clone(&committed));
        assert!(!is_clone(&plain));
    }

    #[test]
    fn test_as_count() {
        assert_eq!(as_count(&json!(3)), Some(3));
        assert_eq!(as_count(&json!(3.0)), Some(3));
        assert_eq!(as_count(&json!("12")), Some(12));
        assert_eq!(as_count(&json!(-1)), None);
        assert_eq!(as_count(&json!(2.5)), None);
        assert_eq!(as_count(&json!(null)), None);
    }

    #[test]
    fn test_params_deserialize_camel_case() {
        let params: Params = serde_json::from_value(json!({
            "query": {"done": false},
            "temps": true,
            "preserveSsr": true,
            "qid": "sidebar"
        }))
        .unwrap();
        assert!(params.temps);
        assert!(!params.clones);
        assert!(params.preserve_ssr);
        assert_eq!(params.qid.as_deref(), Some("sidebar"));
    }
}
