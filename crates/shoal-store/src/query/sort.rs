//! `$sort` parsing and value ordering.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::query::filter::{resolve_path, split_path};
use crate::types::Record;

/// One `$sort` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub path: Vec<String>,
    pub descending: bool,
}

/// Parse a `$sort` directive. Key order sets priority.
pub fn parse_sort(value: &Value) -> Result<Vec<SortKey>> {
    let map = value
        .as_object()
        .ok_or_else(|| StoreError::InvalidQuery("`$sort` expects an object".to_string()))?;
    map.iter()
        .map(|(field, direction)| {
            Ok(SortKey {
                field: field.clone(),
                path: split_path(field),
                descending: parse_direction(field, direction)?,
            })
        })
        .collect()
}

fn parse_direction(field: &str, direction: &Value) -> Result<bool> {
    let descending = match direction {
        Value::Number(n) => match n.as_f64() {
            Some(d) if d > 0.0 => Some(false),
            Some(d) if d < 0.0 => Some(true),
            _ => None,
        },
        Value::String(s) => match s.as_str() {
            "1" | "asc" | "ascending" => Some(false),
            "-1" | "desc" | "descending" => Some(true),
            _ => None,
        },
        _ => None,
    };
    descending.ok_or_else(|| {
        StoreError::InvalidQuery(format!("invalid sort direction for `{field}`: {direction}"))
    })
}

// missing < null < number < string < bool < array < object
fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Bool(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Object(_)) => 6,
    }
}

/// Total order over optional JSON values used by `$sort`.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => Ordering::Equal,
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => x
            .iter()
            .zip(y)
            .map(|(a, b)| compare_values(Some(a), Some(b)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => Ordering::Equal,
    }
}

/// Compare two records by `keys`.
pub fn compare_records(a: &Record, b: &Record, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let va = resolve_path(a, &key.path).into_iter().next();
        let vb = resolve_path(b, &key.path).into_iter().next();
        let ordering = compare_values(va, vb);
        if ordering != Ordering::Equal {
            return if key.descending {
                ordering.reverse()
            } else {
                ordering
            };
        }
    }
    Ordering::Equal
}

/// Stable multi-key sort in place. Ties keep their incoming order.
pub fn sort_records(records: &mut [Record], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    records.sort_by(|a, b| compare_records(a, b, keys));
}
