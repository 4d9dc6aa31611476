//! Local query evaluation over stored records.
//!
//! A query object mixes filter predicates with the `$sort`, `$limit`,
//! `$skip` and `$select` directives. [`QueryEngine::plan`] separates the two
//! and validates operators; [`QueryEngine::run`] filters, counts, sorts and
//! pages a candidate set.

pub mod filter;
pub mod sort;

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::identity::Identity;
use crate::types::{FindResponse, Record, as_count};

pub use filter::{BASE_OPERATORS, EXTENDED_OPERATORS, Filter, OperatorPolicy, values_equal};
pub use sort::{SortKey, compare_values};

/// Query keys that control paging rather than matching.
pub const PAGING_DIRECTIVES: [&str; 2] = ["$limit", "$skip"];

/// A validated query.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub filter: Filter,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub select: Option<Vec<String>>,
}

impl Default for QueryPlan {
    fn default() -> Self {
        Self {
            filter: Filter::everything(),
            sort: Vec::new(),
            limit: None,
            skip: None,
            select: None,
        }
    }
}

/// Evaluates queries under a store's operator policy.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    identity: Arc<Identity>,
    policy: OperatorPolicy,
    params_for_server: Vec<String>,
}

impl QueryEngine {
    pub fn new(identity: Arc<Identity>, policy: OperatorPolicy, params_for_server: Vec<String>) -> Self {
        Self {
            identity,
            policy,
            params_for_server,
        }
    }

    pub fn policy(&self) -> &OperatorPolicy {
        &self.policy
    }

    /// Split directives from predicates and parse the filter.
    ///
    /// Keys listed in `params_for_server` are dropped first.
    pub fn plan(&self, query: &Record) -> Result<QueryPlan> {
        let mut plan = QueryPlan::default();
        let mut predicates = Record::new();

        for (key, value) in query {
            if self.params_for_server.iter().any(|p| p == key) {
                continue;
            }
            match key.as_str() {
                "$sort" => plan.sort = sort::parse_sort(value)?,
                "$limit" => plan.limit = Some(count_directive(key, value)?),
                "$skip" => plan.skip = Some(count_directive(key, value)?),
                "$select" => plan.select = Some(parse_select(value)?),
                _ => {
                    predicates.insert(key.clone(), value.clone());
                }
            }
        }

        plan.filter = Filter::parse(&predicates, &self.policy)?;
        Ok(plan)
    }

    /// Filter, count, sort and page `candidates`.
    ///
    /// `total` counts every match before `$skip`/`$limit`. A `$select`
    /// projection is applied to the returned copies only.
    pub fn run(&self, plan: &QueryPlan, candidates: Vec<Record>) -> FindResponse {
        let mut matched: Vec<Record> = candidates
            .into_iter()
            .filter(|record| plan.filter.matches(record))
            .collect();
        let total = matched.len();

        sort::sort_records(&mut matched, &plan.sort);

        let skip = plan.skip.unwrap_or(0);
        let data = matched
            .into_iter()
            .skip(skip)
            .take(plan.limit.unwrap_or(usize::MAX))
            .map(|record| match &plan.select {
                Some(fields) => self.project(&record, fields),
                None => record,
            })
            .collect();

        FindResponse {
            total,
            limit: plan.limit.unwrap_or(0),
            skip,
            data,
        }
    }

    /// Plan and run in one step.
    pub fn find(&self, query: &Record, candidates: Vec<Record>) -> Result<FindResponse> {
        let plan = self.plan(query)?;
        Ok(self.run(&plan, candidates))
    }

    /// Whether `record` satisfies the filter part of `query`.
    pub fn matches(&self, query: &Record, record: &Record) -> Result<bool> {
        Ok(self.plan(query)?.filter.matches(record))
    }

    /// Copy of `record` with only `fields` and its identity fields.
    pub fn project(&self, record: &Record, fields: &[String]) -> Record {
        let keep_always = [self.identity.id_field(), self.identity.temp_id_field()];
        record
            .iter()
            .filter(|(key, _)| {
                keep_always.contains(&key.as_str()) || fields.iter().any(|f| f == *key)
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Copy of `query` without `$limit`/`$skip`.
pub fn strip_paging(query: &Record) -> Record {
    let mut stripped = query.clone();
    for key in PAGING_DIRECTIVES {
        stripped.remove(key);
    }
    stripped
}

fn count_directive(key: &str, value: &Value) -> Result<usize> {
    as_count(value)
        .ok_or_else(|| StoreError::InvalidQuery(format!("`{key}` expects a non-negative integer")))
}

fn parse_select(value: &Value) -> Result<Vec<String>> {
    let invalid = || StoreError::InvalidQuery("`$select` expects an array of field names".to_string());
    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|field| field.as_str().map(str::to_string).ok_or_else(invalid))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::into_record;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rec(value: Value) -> Record {
        into_record(value).unwrap()
    }

    fn engine(params_for_server: &[&str]) -> QueryEngine {
        QueryEngine::new(
            Arc::new(Identity::default()),
            OperatorPolicy::default(),
            params_for_server.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn people() -> Vec<Record> {
        ["ann", "bob", "cy", "dee", "eve"]
            .iter()
            .enumerate()
            .map(|(i, name)| rec(json!({"id": i + 1, "name": name, "age": 20 + (i % 2)})))
            .collect()
    }

    #[test]
    fn test_total_counts_before_paging() {
        let response = engine(&[])
            .find(
                &rec(json!({"age": 20, "$sort": {"name": -1}, "$limit": 2, "$skip": 1})),
                people(),
            )
            .unwrap();

        assert_eq!(response.total, 3);
        assert_eq!(response.limit, 2);
        assert_eq!(response.skip, 1);
        let names: Vec<_> = response.data.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("cy"), json!("ann")]);
    }

    #[test]
    fn test_limit_and_skip_default_to_zero() {
        let response = engine(&[]).find(&Record::new(), people()).unwrap();
        assert_eq!(response.total, 5);
        assert_eq!(response.limit, 0);
        assert_eq!(response.skip, 0);
        assert_eq!(response.data.len(), 5);
    }

    #[test]
    fn test_select_keeps_identity() {
        let response = engine(&[])
            .find(&rec(json!({"$select": ["name"], "id": 1})), people())
            .unwrap();
        assert_eq!(response.data, vec![rec(json!({"id": 1, "name": "ann"}))]);
    }

    #[test]
    fn test_params_for_server_are_ignored_locally() {
        let response = engine(&["$populate", "tenant"])
            .find(&rec(json!({"$populate": "x", "tenant": 9})), people())
            .unwrap();
        assert_eq!(response.total, 5);
    }

    #[test]
    fn test_bad_directives() {
        let engine = engine(&[]);
        assert!(engine.plan(&rec(json!({"$limit": -1}))).is_err());
        assert!(engine.plan(&rec(json!({"$select": "name"}))).is_err());
        assert!(engine.plan(&rec(json!({"$sort": {"a": 2}}))).is_ok());
    }

    #[test]
    fn test_strip_paging() {
        let query = rec(json!({"a": 1, "$limit": 3, "$skip": 6, "$sort": {"a": 1}}));
        assert_eq!(strip_paging(&query), rec(json!({"a": 1, "$sort": {"a": 1}})));
    }
}
