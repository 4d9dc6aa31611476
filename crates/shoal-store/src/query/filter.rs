//! Filter predicates: a MongoDB-style query subset.
//!
//! A query object is parsed once into a [`Filter`] tree and then evaluated
//! against each candidate record. Parsing is where the operator policy is
//! enforced: an operator outside the base set and the store's whitelist
//! rejects the whole query instead of being ignored.
//!
//! Field keys may be dotted paths (`author.name`, `tags.0`). When a path
//! crosses an array, every element is visited, and equality-style operators
//! match an array field if any element matches.

use std::cmp::Ordering;
use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::types::{Record, as_count};

/// Operators every store evaluates locally.
pub const BASE_OPERATORS: [&str; 15] = [
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists", "$or", "$and", "$like",
    "$ilike", "$notLike", "$notILike",
];

/// Operators the local matcher can evaluate once whitelisted.
pub const EXTENDED_OPERATORS: [&str; 7] = [
    "$nor",
    "$not",
    "$regex",
    "$options",
    "$elemMatch",
    "$all",
    "$size",
];

/// Which query operators a store accepts.
#[derive(Debug, Clone, Default)]
pub struct OperatorPolicy {
    whitelist: HashSet<String>,
}

impl OperatorPolicy {
    /// Base operators plus `whitelist`.
    pub fn new<I, S>(whitelist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            whitelist: whitelist.into_iter().map(Into::into).collect(),
        }
    }

    /// Every operator the local matcher can evaluate.
    pub fn permissive() -> Self {
        Self::new(EXTENDED_OPERATORS)
    }

    /// Whether `operator` may appear in a query.
    pub fn allows(&self, operator: &str) -> bool {
        BASE_OPERATORS.contains(&operator) || self.whitelist.contains(operator)
    }

    fn check(&self, operator: &str) -> Result<()> {
        if self.allows(operator) {
            Ok(())
        } else {
            Err(StoreError::DisallowedOperator {
                operator: operator.to_string(),
            })
        }
    }
}

/// A parsed query predicate.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Every clause matches. An empty conjunction matches everything.
    And(Vec<Filter>),
    /// At least one clause matches.
    Or(Vec<Filter>),
    /// No clause matches.
    Nor(Vec<Filter>),
    /// Every predicate holds for the values at `path`.
    Field {
        path: Vec<String>,
        predicates: Vec<Predicate>,
    },
}

/// A condition on the value(s) found at a field path.
#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Compare(Comparison, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Matches(Regex),
    NotMatches(Regex),
    Not(Vec<Predicate>),
    ElemMatch(ElemMatch),
    All(Vec<Value>),
    Size(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Gte => ordering != Ordering::Less,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Lte => ordering != Ordering::Greater,
        }
    }
}

/// `$elemMatch` operand: a sub-query for object elements, or operator
/// predicates for scalar elements.
#[derive(Debug, Clone)]
pub enum ElemMatch {
    Record(Box<Filter>),
    Value(Vec<Predicate>),
}

impl ElemMatch {
    fn matches(&self, element: &Value) -> bool {
        match self {
            ElemMatch::Record(filter) => element.as_object().is_some_and(|map| filter.matches(map)),
            ElemMatch::Value(predicates) => predicates.iter().all(|p| p.test(&[element])),
        }
    }
}

impl Filter {
    /// Parse a filter query (directives such as `$sort` already removed).
    pub fn parse(query: &Record, policy: &OperatorPolicy) -> Result<Self> {
        let mut clauses = Vec::with_capacity(query.len());
        for (key, operand) in query {
            if key.starts_with('$') {
                policy.check(key)?;
                let clause = match key.as_str() {
                    "$and" => Filter::And(parse_branches(key, operand, policy)?),
                    "$or" => Filter::Or(parse_branches(key, operand, policy)?),
                    "$nor" => Filter::Nor(parse_branches(key, operand, policy)?),
                    _ => {
                        return Err(StoreError::UnsupportedOperator {
                            operator: key.clone(),
                        });
                    }
                };
                clauses.push(clause);
            } else {
                clauses.push(Filter::Field {
                    path: split_path(key),
                    predicates: parse_condition(operand, policy)?,
                });
            }
        }
        Ok(Filter::And(clauses))
    }

    /// A filter matching every record.
    pub fn everything() -> Self {
        Filter::And(Vec::new())
    }

    /// Evaluate against a record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::And(clauses) => clauses.iter().all(|c| c.matches(record)),
            Filter::Or(clauses) => clauses.iter().any(|c| c.matches(record)),
            Filter::Nor(clauses) => !clauses.iter().any(|c| c.matches(record)),
            Filter::Field { path, predicates } => {
                let values = resolve_path(record, path);
                predicates.iter().all(|p| p.test(&values))
            }
        }
    }
}

impl Predicate {
    /// Test the values resolved at a path. An empty slice means "missing".
    fn test(&self, values: &[&Value]) -> bool {
        match self {
            Predicate::Eq(expected) => eq_match(values, expected),
            Predicate::Ne(expected) => !eq_match(values, expected),
            Predicate::Compare(comparison, operand) => any_candidate(values, |v| {
                compare_scalars(v, operand).is_some_and(|o| comparison.accepts(o))
            }),
            Predicate::In(list) => list.iter().any(|e| eq_match(values, e)),
            Predicate::Nin(list) => !list.iter().any(|e| eq_match(values, e)),
            Predicate::Exists(expected) => values.is_empty() != *expected,
            Predicate::Matches(regex) => regex_match(values, regex),
            Predicate::NotMatches(regex) => !regex_match(values, regex),
            Predicate::Not(inner) => !inner.iter().all(|p| p.test(values)),
            Predicate::ElemMatch(elem) => values.iter().any(|v| match v {
                Value::Array(items) => items.iter().any(|item| elem.matches(item)),
                _ => false,
            }),
            Predicate::All(expected) => values.iter().any(|v| match v {
                Value::Array(items) => expected
                    .iter()
                    .all(|e| items.iter().any(|item| values_equal(item, e))),
                _ => false,
            }),
            Predicate::Size(len) => values
                .iter()
                .any(|v| matches!(v, Value::Array(items) if items.len() == *len)),
        }
    }
}

fn parse_branches(operator: &str, operand: &Value, policy: &OperatorPolicy) -> Result<Vec<Filter>> {
    let branches = match operand {
        Value::Array(branches) if !branches.is_empty() => branches,
        _ => {
            return Err(StoreError::InvalidQuery(format!(
                "`{operator}` expects a non-empty array of queries"
            )));
        }
    };
    branches
        .iter()
        .map(|branch| match branch {
            Value::Object(query) => Filter::parse(query, policy),
            _ => Err(StoreError::InvalidQuery(format!(
                "`{operator}` branches must be objects"
            ))),
        })
        .collect()
}

fn is_operator_object(map: &Record) -> bool {
    map.keys().any(|key| key.starts_with('$'))
}

fn parse_condition(operand: &Value, policy: &OperatorPolicy) -> Result<Vec<Predicate>> {
    match operand {
        Value::Object(map) if is_operator_object(map) => parse_operators(map, policy),
        other => Ok(vec![Predicate::Eq(other.clone())]),
    }
}

fn parse_operators(map: &Record, policy: &OperatorPolicy) -> Result<Vec<Predicate>> {
    let mut predicates = Vec::with_capacity(map.len());
    for (operator, arg) in map {
        if !operator.starts_with('$') {
            return Err(StoreError::InvalidQuery(format!(
                "field `{operator}` cannot be mixed with operators"
            )));
        }
        policy.check(operator)?;
        let predicate = match operator.as_str() {
            "$eq" => Predicate::Eq(arg.clone()),
            "$ne" => Predicate::Ne(arg.clone()),
            "$gt" => Predicate::Compare(Comparison::Gt, arg.clone()),
            "$gte" => Predicate::Compare(Comparison::Gte, arg.clone()),
            "$lt" => Predicate::Compare(Comparison::Lt, arg.clone()),
            "$lte" => Predicate::Compare(Comparison::Lte, arg.clone()),
            "$in" => Predicate::In(list_operand(operator, arg)?),
            "$nin" => Predicate::Nin(list_operand(operator, arg)?),
            "$exists" => Predicate::Exists(truthy(arg)),
            "$like" => Predicate::Matches(like_regex(operator, arg, false)?),
            "$ilike" => Predicate::Matches(like_regex(operator, arg, true)?),
            "$notLike" => Predicate::NotMatches(like_regex(operator, arg, false)?),
            "$notILike" => Predicate::NotMatches(like_regex(operator, arg, true)?),
            "$regex" => Predicate::Matches(regex_operand(arg, map.get("$options"))?),
            "$options" => {
                if !map.contains_key("$regex") {
                    return Err(StoreError::InvalidQuery(
                        "`$options` requires `$regex`".to_string(),
                    ));
                }
                continue;
            }
            "$not" => Predicate::Not(parse_condition(arg, policy)?),
            "$elemMatch" => Predicate::ElemMatch(parse_elem_match(arg, policy)?),
            "$all" => Predicate::All(list_operand(operator, arg)?),
            "$size" => Predicate::Size(as_count(arg).ok_or_else(|| {
                StoreError::InvalidQuery("`$size` expects a non-negative integer".to_string())
            })?),
            "$and" | "$or" | "$nor" => {
                return Err(StoreError::InvalidQuery(format!(
                    "`{operator}` is only valid at the top level of a query"
                )));
            }
            _ => {
                return Err(StoreError::UnsupportedOperator {
                    operator: operator.clone(),
                });
            }
        };
        predicates.push(predicate);
    }
    Ok(predicates)
}

fn parse_elem_match(arg: &Value, policy: &OperatorPolicy) -> Result<ElemMatch> {
    let map = arg.as_object().ok_or_else(|| {
        StoreError::InvalidQuery("`$elemMatch` expects an object".to_string())
    })?;
    let logical = map
        .keys()
        .any(|k| matches!(k.as_str(), "$and" | "$or" | "$nor"));
    if is_operator_object(map) && !logical {
        Ok(ElemMatch::Value(parse_operators(map, policy)?))
    } else {
        Ok(ElemMatch::Record(Box::new(Filter::parse(map, policy)?)))
    }
}

fn list_operand(operator: &str, arg: &Value) -> Result<Vec<Value>> {
    match arg {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(StoreError::InvalidQuery(format!(
            "`{operator}` expects an array"
        ))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !matches!(s.as_str(), "" | "0" | "false"),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Build an anchored regex from a `%`-wildcard pattern.
fn like_regex(operator: &str, arg: &Value, case_insensitive: bool) -> Result<Regex> {
    let pattern = arg
        .as_str()
        .ok_or_else(|| StoreError::InvalidQuery(format!("`{operator}` expects a string")))?;
    let body = pattern
        .split('%')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    RegexBuilder::new(&format!("^{body}$"))
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| StoreError::InvalidQuery(e.to_string()))
}

fn regex_operand(arg: &Value, options: Option<&Value>) -> Result<Regex> {
    let pattern = arg
        .as_str()
        .ok_or_else(|| StoreError::InvalidQuery("`$regex` expects a string".to_string()))?;
    let mut builder = RegexBuilder::new(pattern);
    if let Some(options) = options {
        let flags = options.as_str().ok_or_else(|| {
            StoreError::InvalidQuery("`$options` expects a string".to_string())
        })?;
        for flag in flags.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                'x' => builder.ignore_whitespace(true),
                other => {
                    return Err(StoreError::InvalidQuery(format!(
                        "unknown `$options` flag `{other}`"
                    )));
                }
            };
        }
    }
    builder
        .build()
        .map_err(|e| StoreError::InvalidQuery(e.to_string()))
}

/// Split a dotted field key into path segments.
pub fn split_path(key: &str) -> Vec<String> {
    key.split('.').map(str::to_string).collect()
}

/// Every value reachable at `path`, visiting array elements along the way.
pub fn resolve_path<'a>(record: &'a Record, path: &[String]) -> Vec<&'a Value> {
    let mut out = Vec::new();
    if let Some((first, rest)) = path.split_first()
        && let Some(value) = record.get(first)
    {
        descend(value, rest, &mut out);
    }
    out
}

fn descend<'a>(value: &'a Value, path: &[String], out: &mut Vec<&'a Value>) {
    let Some((segment, rest)) = path.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(segment) {
                descend(next, rest, out);
            }
        }
        Value::Array(items) => match segment.parse::<usize>() {
            Ok(index) => {
                if let Some(next) = items.get(index) {
                    descend(next, rest, out);
                }
            }
            Err(_) => {
                for item in items {
                    if let Value::Object(map) = item
                        && let Some(next) = map.get(segment)
                    {
                        descend(next, rest, out);
                    }
                }
            }
        },
        _ => {}
    }
}

fn any_candidate(values: &[&Value], test: impl Fn(&Value) -> bool) -> bool {
    values.iter().any(|value| {
        test(value)
            || matches!(value, Value::Array(items) if items.iter().any(&test))
    })
}

fn eq_match(values: &[&Value], expected: &Value) -> bool {
    if values.is_empty() {
        return expected.is_null();
    }
    any_candidate(values, |v| values_equal(v, expected))
}

fn regex_match(values: &[&Value], regex: &Regex) -> bool {
    any_candidate(values, |v| v.as_str().is_some_and(|s| regex.is_match(s)))
}

/// Structural equality treating `1` and `1.0` as equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

/// Order two values of the same scalar kind; `None` when they are not comparable.
fn compare_scalars(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
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

    fn check(query: Value, record: Value) -> bool {
        Filter::parse(&rec(query), &OperatorPolicy::permissive())
            .unwrap()
            .matches(&rec(record))
    }

    #[test]
    fn test_equality_and_comparisons() {
        assert!(check(json!({"a": 1}), json!({"a": 1.0})));
        assert!(!check(json!({"a": 1}), json!({"a": "1"})));
        assert!(check(json!({"a": {"$gt": 1, "$lte": 3}}), json!({"a": 3})));
        assert!(!check(json!({"a": {"$gt": 1}}), json!({"a": "5"})));
        assert!(check(json!({"a": {"$ne": 1}}), json!({"b": 2})));
        assert!(check(json!({"a": null}), json!({"b": 2})));
    }

    #[test]
    fn test_in_and_exists() {
        assert!(check(json!({"a": {"$in": [1, 2]}}), json!({"a": 2})));
        assert!(!check(json!({"a": {"$nin": [1, 2]}}), json!({"a": 2})));
        assert!(check(json!({"a": {"$exists": true}}), json!({"a": null})));
        assert!(check(json!({"a": {"$exists": false}}), json!({"b": 1})));
    }

    #[test]
    fn test_logical_operators() {
        let query = json!({"$or": [{"a": 1}, {"b": {"$gte": 5}}]});
        assert!(check(query.clone(), json!({"a": 1})));
        assert!(check(query.clone(), json!({"b": 9})));
        assert!(!check(query, json!({"a": 2, "b": 1})));
        assert!(check(json!({"$and": [{"a": 1}, {"b": 2}]}), json!({"a": 1, "b": 2})));
        assert!(check(json!({"$nor": [{"a": 1}]}), json!({"a": 2})));
    }

    #[test]
    fn test_like_operators() {
        let texts = ["Moose", "moose", "Goose", "Loose"];
        let like: Vec<_> = texts
            .iter()
            .filter(|t| check(json!({"text": {"$like": "%Mo%"}}), json!({"text": t})))
            .collect();
        assert_eq!(like, vec![&"Moose"]);

        let ilike: Vec<_> = texts
            .iter()
            .filter(|t| check(json!({"text": {"$ilike": "%Mo%"}}), json!({"text": t})))
            .collect();
        assert_eq!(ilike, vec![&"Moose", &"moose"]);

        assert!(check(json!({"text": {"$notLike": "%oo%"}}), json!({"text": "cat"})));
        assert!(!check(json!({"text": {"$notILike": "G%"}}), json!({"text": "goose"})));
    }

    #[test]
    fn test_like_escapes_regex_syntax() {
        assert!(check(json!({"v": {"$like": "a.c"}}), json!({"v": "a.c"})));
        assert!(!check(json!({"v": {"$like": "a.c"}}), json!({"v": "abc"})));
        assert!(check(json!({"v": {"$like": "(%)"}}), json!({"v": "(x)"})));
    }

    #[test]
    fn test_dotted_paths_and_arrays() {
        let record = json!({"author": {"name": "ann"}, "tags": ["x", "y"], "items": [{"n": 1}, {"n": 2}]});
        assert!(check(json!({"author.name": "ann"}), record.clone()));
        assert!(check(json!({"tags": "y"}), record.clone()));
        assert!(check(json!({"tags.1": "y"}), record.clone()));
        assert!(check(json!({"items.n": 2}), record.clone()));
        assert!(check(json!({"tags": {"$in": ["z", "x"]}}), record.clone()));
        assert!(check(json!({"tags": ["x", "y"]}), record));
    }

    #[test]
    fn test_extended_operators() {
        let record = json!({"tags": ["a", "b"], "scores": [3, 8], "name": "Bob"});
        assert!(check(json!({"tags": {"$all": ["b", "a"]}}), record.clone()));
        assert!(check(json!({"tags": {"$size": 2}}), record.clone()));
        assert!(check(json!({"scores": {"$elemMatch": {"$gt": 5}}}), record.clone()));
        assert!(check(json!({"name": {"$regex": "^b", "$options": "i"}}), record.clone()));
        assert!(check(json!({"name": {"$not": {"$like": "A%"}}}), record));
    }

    #[test]
    fn test_operator_policy() {
        let base = OperatorPolicy::default();
        let err = Filter::parse(&rec(json!({"a": {"$regex": "x"}})), &base).unwrap_err();
        assert!(matches!(err, StoreError::DisallowedOperator { operator } if operator == "$regex"));

        let err = Filter::parse(&rec(json!({"$where": "1"})), &base).unwrap_err();
        assert!(matches!(err, StoreError::DisallowedOperator { .. }));

        let odd = OperatorPolicy::new(["$near"]);
        let err = Filter::parse(&rec(json!({"loc": {"$near": [0, 0]}})), &odd).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedOperator { operator } if operator == "$near"));
    }

    #[test]
    fn test_malformed_operands() {
        let policy = OperatorPolicy::permissive();
        for query in [
            json!({"a": {"$in": 1}}),
            json!({"$or": []}),
            json!({"$or": [1]}),
            json!({"a": {"$like": 5}}),
            json!({"a": {"$gt": 1, "b": 2}}),
            json!({"a": {"$options": "i"}}),
        ] {
            let result = Filter::parse(&rec(query.clone()), &policy);
            assert!(
                matches!(result, Err(StoreError::InvalidQuery(_))),
                "expected InvalidQuery for {query}"
            );
        }
    }
}
