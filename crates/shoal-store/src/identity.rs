//! Record identity and query fingerprinting.
//!
//! Every storage tier is keyed by a `String` derived from a record field, so
//! numeric, string and structured ids all compare as the same primitive.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{Params, Record, as_count};

/// Query identifier used when the caller does not supply one.
pub const DEFAULT_QID: &str = "default";

/// Field names used to resolve a record's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    id_field: String,
    alt_id_field: Option<String>,
    temp_id_field: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self::new("id", Some("_id".to_string()), "__tempId")
    }
}

impl Identity {
    /// Create an identity resolver.
    pub fn new(
        id_field: impl Into<String>,
        alt_id_field: Option<String>,
        temp_id_field: impl Into<String>,
    ) -> Self {
        Self {
            id_field: id_field.into(),
            alt_id_field,
            temp_id_field: temp_id_field.into(),
        }
    }

    /// Name of the permanent id field.
    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// Name of the temp id field.
    pub fn temp_id_field(&self) -> &str {
        &self.temp_id_field
    }

    /// Permanent identity: the id field, else the alternate id field.
    pub fn id_of(&self, record: &Record) -> Option<String> {
        record.get(&self.id_field).and_then(key_of).or_else(|| {
            self.alt_id_field
                .as_ref()
                .and_then(|field| record.get(field))
                .and_then(key_of)
        })
    }

    /// Temporary identity.
    pub fn temp_id_of(&self, record: &Record) -> Option<String> {
        record.get(&self.temp_id_field).and_then(key_of)
    }

    /// Permanent identity if present, else the temporary one.
    pub fn any_id_of(&self, record: &Record) -> Option<String> {
        self.id_of(record).or_else(|| self.temp_id_of(record))
    }

    /// Assign a temp id to `record` unless it already has one. Returns it.
    pub fn ensure_temp_id(&self, record: &mut Record) -> String {
        if let Some(existing) = self.temp_id_of(record) {
            return existing;
        }
        let temp_id = new_temp_id();
        record.insert(self.temp_id_field.clone(), Value::String(temp_id.clone()));
        temp_id
    }

    /// Remove the temp id field from `record`.
    pub fn strip_temp_id(&self, record: &mut Record) -> Option<Value> {
        record.remove(&self.temp_id_field)
    }
}

/// Normalize an id value into a storage key.
///
/// Structured ids are fingerprinted; `null` is never an identity.
pub fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => Some(fingerprint(value)),
    }
}

/// Generate a fresh session-local temp id.
pub fn new_temp_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Deterministic, key-order-independent serialization of a JSON value.
///
/// Object keys are emitted sorted at every depth, so structurally equal values
/// always produce the same string and any structural difference changes it.
pub fn fingerprint(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

/// Fingerprint of a record.
pub fn fingerprint_record(record: &Record) -> String {
    let mut out = String::new();
    write_object(record, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_object(map: &Record, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::from(key.as_str()).to_string());
        out.push(':');
        write_stable(&map[key], out);
    }
    out.push('}');
}

/// Paging half of a query, as recorded in the pagination ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageParams {
    #[serde(rename = "$limit")]
    pub limit: usize,
    #[serde(rename = "$skip", default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
}

impl PageParams {
    /// Fingerprint identifying this page shape.
    pub fn fingerprint(&self) -> String {
        let mut map = Record::new();
        map.insert("$limit".to_string(), Value::from(self.limit));
        if let Some(skip) = self.skip {
            map.insert("$skip".to_string(), Value::from(skip));
        }
        fingerprint_record(&map)
    }
}

/// Ledger keys derived from a query and the response metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryInfo {
    pub qid: String,
    pub query: Record,
    pub query_id: String,
    pub query_params: Record,
    pub page_params: Option<PageParams>,
    pub page_id: Option<String>,
}

/// Derive ledger keys for `params`.
///
/// Limit/skip come from the response metadata when present (the service may
/// clamp the limit), otherwise from the query.
pub fn query_info(
    params: &Params,
    response_limit: Option<usize>,
    response_skip: Option<usize>,
) -> QueryInfo {
    let query = params.query.clone().unwrap_or_default();
    let qid = params
        .qid
        .clone()
        .unwrap_or_else(|| DEFAULT_QID.to_string());

    let limit = response_limit.or_else(|| query.get("$limit").and_then(as_count));
    let skip = response_skip.or_else(|| query.get("$skip").and_then(as_count));

    let mut query_params = query.clone();
    query_params.remove("$limit");
    query_params.remove("$skip");
    let query_id = fingerprint_record(&query_params);

    let page_params = limit.map(|limit| PageParams { limit, skip });
    let page_id = page_params.as_ref().map(PageParams::fingerprint);

    QueryInfo {
        qid,
        query,
        query_id,
        query_params,
        page_params,
        page_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::into_record;
    use serde_json::json;

    fn rec(value: Value) -> Record {
        into_record(value).unwrap()
    }

    #[test]
    fn test_id_of_prefers_id_field() {
        let identity = Identity::default();
        assert_eq!(identity.id_of(&rec(json!({"id": 7, "_id": "x"}))), Some("7".into()));
        assert_eq!(identity.id_of(&rec(json!({"_id": "abc"}))), Some("abc".into()));
        assert_eq!(identity.id_of(&rec(json!({"id": null}))), None);
        assert_eq!(identity.id_of(&rec(json!({"text": "x"}))), None);
    }

    #[test]
    fn test_structured_id_is_stringified() {
        let identity = Identity::default();
        let a = identity.id_of(&rec(json!({"id": {"b": 2, "a": 1}}))).unwrap();
        let b = identity.id_of(&rec(json!({"id": {"a": 1, "b": 2}}))).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn test_any_id_falls_back_to_temp() {
        let identity = Identity::default();
        let temp = rec(json!({"__tempId": "t1", "text": "x"}));
        assert_eq!(identity.id_of(&temp), None);
        assert_eq!(identity.any_id_of(&temp), Some("t1".into()));

        let both = rec(json!({"__tempId": "t1", "id": 3}));
        assert_eq!(identity.any_id_of(&both), Some("3".into()));
    }

    #[test]
    fn test_custom_fields() {
        let identity = Identity::new("_id", None, "tmp");
        let record = rec(json!({"id": 1, "_id": "m", "tmp": "q"}));
        assert_eq!(identity.id_of(&record), Some("m".into()));
        assert_eq!(identity.temp_id_of(&record), Some("q".into()));
    }

    #[test]
    fn test_ensure_temp_id_is_stable() {
        let identity = Identity::default();
        let mut record = rec(json!({"text": "x"}));
        let first = identity.ensure_temp_id(&mut record);
        let second = identity.ensure_temp_id(&mut record);
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn test_fingerprint_key_order_independent() {
        assert_eq!(
            fingerprint(&json!({"a": 1, "b": 2})),
            fingerprint(&json!({"b": 2, "a": 1}))
        );
        assert_eq!(
            fingerprint(&json!({"x": {"d": [1, {"z": 1, "y": 2}], "c": null}})),
            fingerprint(&json!({"x": {"c": null, "d": [1, {"y": 2, "z": 1}]}}))
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_nested_values() {
        assert_ne!(fingerprint(&json!({"a": {"b": 1}})), fingerprint(&json!({"a": {"b": 2}})));
        assert_ne!(fingerprint(&json!({"a": [1, 2]})), fingerprint(&json!({"a": [2, 1]})));
        assert_ne!(fingerprint(&json!({"a": "1"})), fingerprint(&json!({"a": 1})));
        assert_ne!(fingerprint(&json!({"a": null})), fingerprint(&json!({})));
    }

    #[test]
    fn test_fingerprint_distinguishes_types_and_operators() {
        assert_ne!(fingerprint(&json!(1)), fingerprint(&json!("1")));
        assert_ne!(fingerprint(&json!(true)), fingerprint(&json!("true")));
        assert_ne!(fingerprint(&json!(null)), fingerprint(&json!("null")));
        assert_ne!(fingerprint(&json!([1])), fingerprint(&json!(1)));
        assert_ne!(
            fingerprint(&json!({"a": {"$gt": 1}})),
            fingerprint(&json!({"a": {"$gte": 1}}))
        );
        assert_ne!(
            fingerprint(&json!({"$or": [{"a": 1}, {"b": 2}]})),
            fingerprint(&json!({"$or": [{"a": 1}], "b": 2}))
        );
    }

    #[test]
    fn test_query_info_strips_paging() {
        let params = Params::from_query(rec(json!({"done": false, "$limit": 3, "$skip": 6})));
        let info = query_info(&params, None, None);

        assert_eq!(info.qid, DEFAULT_QID);
        assert_eq!(info.query_params, rec(json!({"done": false})));
        assert_eq!(info.query_id, r#"{"done":false}"#);
        assert_eq!(info.page_params, Some(PageParams { limit: 3, skip: Some(6) }));
        assert_eq!(info.page_id.as_deref(), Some(r#"{"$limit":3,"$skip":6}"#));
    }

    #[test]
    fn test_query_info_prefers_response_limit() {
        let params = Params::from_query(rec(json!({"$limit": 500}))).with_qid("list");
        let info = query_info(&params, Some(100), Some(0));

        assert_eq!(info.qid, "list");
        assert_eq!(info.page_params, Some(PageParams { limit: 100, skip: Some(0) }));
    }

    #[test]
    fn test_query_info_without_paging() {
        let info = query_info(&Params::default(), None, None);
        assert_eq!(info.query_id, "{}");
        assert!(info.page_params.is_none());
        assert!(info.page_id.is_none());
    }
}
