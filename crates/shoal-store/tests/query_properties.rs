//! Property-based tests for local queries, fingerprints and clones.

use proptest::prelude::*;
use serde_json::{Value, json};

use shoal_store::{CLONE_FLAG, Params, Record, Store, fingerprint_record, into_record};

fn rec(value: Value) -> Record {
    into_record(value).expect("object literal")
}

// Strategy for small records with a few overlapping values
fn scores() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0i64..5, 0..40)
}

// Strategy for flat query-like objects
fn flat_object() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::btree_map("[a-z$]{1,6}", -100i64..100, 0..8)
        .prop_map(|map| map.into_iter().collect())
}

// Strategy for arbitrary JSON: scalars, arrays and objects up to three levels deep
fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        (-50i64..50).prop_map(Value::from),
        "[a-z0-9]{0,4}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z$]{1,4}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

// Strategy for query-like objects with nested operator objects
fn query_object() -> impl Strategy<Value = Record> {
    prop::collection::btree_map("[a-z$]{1,6}", json_value(), 1..5)
        .prop_map(|map| map.into_iter().collect())
}

/// How a query is changed before re-fingerprinting.
#[derive(Debug, Clone, Copy)]
enum Edit {
    AddKey,
    RemoveKey,
    Retype,
    RenameNested,
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        Just(Edit::AddKey),
        Just(Edit::RemoveKey),
        Just(Edit::Retype),
        Just(Edit::RenameNested),
    ]
}

/// Follow first children down to a scalar or an empty container.
fn first_leaf(value: &mut Value) -> &mut Value {
    let has_child = match &*value {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => false,
    };
    if !has_child {
        return value;
    }
    match value {
        Value::Object(map) => first_leaf(map.values_mut().next().expect("non-empty object")),
        Value::Array(items) => first_leaf(&mut items[0]),
        _ => unreachable!("scalars have no children"),
    }
}

/// The same value under a different JSON type.
fn retyped(value: &Value) -> Value {
    match value {
        Value::Null => json!(false),
        Value::Bool(b) => json!(b.to_string()),
        Value::Number(n) => json!(n.to_string()),
        Value::String(s) => json!([s]),
        Value::Array(_) => json!({}),
        Value::Object(_) => json!([]),
    }
}

/// Rename the first key of the deepest first-child object (`$gt` becomes `$gte`).
fn rename_nested(value: &mut Value) -> bool {
    let Value::Object(map) = value else {
        return false;
    };
    let Some(first) = map.keys().next().cloned() else {
        return false;
    };
    let child = map.get_mut(&first).expect("key just read");
    if rename_nested(child) {
        return true;
    }
    let moved = map.remove(&first).expect("key just read");
    map.insert(format!("{first}e"), moved);
    true
}

fn apply_edit(query: &Record, edit: Edit) -> Record {
    let mut changed = query.clone();
    match edit {
        Edit::AddKey => {
            changed.insert("$added".into(), json!(1));
        }
        Edit::RemoveKey => {
            let key = changed.keys().next().cloned().expect("non-empty query");
            changed.remove(&key);
        }
        Edit::Retype => {
            let leaf = first_leaf(changed.values_mut().next().expect("non-empty query"));
            let replacement = retyped(leaf);
            *leaf = replacement;
        }
        Edit::RenameNested => {
            let mut wrapped = Value::Object(changed);
            rename_nested(&mut wrapped);
            let Value::Object(map) = wrapped else {
                unreachable!("wrapped an object")
            };
            changed = map;
        }
    }
    changed
}

/// Change the value at the end of the first-child path, keeping its shape elsewhere.
fn edit_deep(value: &mut Value) {
    let leaf = first_leaf(value);
    let replacement = match &*leaf {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("edited".into(), json!(true));
            Value::Object(map)
        }
        Value::Array(items) => {
            let mut items = items.clone();
            items.push(json!("edited"));
            Value::Array(items)
        }
        scalar => json!({"edited": scalar}),
    };
    *leaf = replacement;
}

fn store_of(scores: &[i64]) -> std::sync::Arc<Store> {
    let store = Store::local("scores").unwrap();
    store
        .add_all(
            scores
                .iter()
                .enumerate()
                .map(|(id, score)| rec(json!({"id": id, "score": score}))),
        )
        .unwrap();
    store
}

proptest! {
    #[test]
    fn fingerprint_ignores_key_order(pairs in flat_object()) {
        let forward: Record = pairs.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
        let backward: Record = pairs.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
        prop_assert_eq!(fingerprint_record(&forward), fingerprint_record(&backward));
    }

    #[test]
    fn fingerprint_distinguishes_values(pairs in flat_object(), bump in 1i64..10) {
        prop_assume!(!pairs.is_empty());
        let original: Record = pairs.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
        let mut changed = original.clone();
        let (key, value) = &pairs[0];
        changed.insert(key.clone(), json!(value + bump));
        prop_assert_ne!(fingerprint_record(&original), fingerprint_record(&changed));
    }

    #[test]
    fn fingerprint_distinguishes_structural_edits(query in query_object(), edit in edit()) {
        let changed = apply_edit(&query, edit);
        prop_assume!(changed != query);
        prop_assert_ne!(fingerprint_record(&query), fingerprint_record(&changed));
    }

    #[test]
    fn fingerprint_distinguishes_operators(
        field in "[a-z]{1,6}",
        ops in prop::sample::subsequence(vec!["$gt", "$gte", "$lt", "$lte", "$ne", "$in", "$nin"], 2),
        operand in json_value(),
    ) {
        let query = |op: &str| {
            let mut inner = Record::new();
            inner.insert(op.to_string(), operand.clone());
            let mut query = Record::new();
            query.insert(field.clone(), Value::Object(inner));
            query
        };
        prop_assert_ne!(fingerprint_record(&query(ops[0])), fingerprint_record(&query(ops[1])));
    }

    #[test]
    fn total_is_independent_of_paging(
        scores in scores(),
        min in 0i64..5,
        limit in 0usize..15,
        skip in 0usize..45,
    ) {
        let store = store_of(&scores);
        let expected = scores.iter().filter(|s| **s >= min).count();

        let response = store
            .find_in_store(&Params::from_query(rec(json!({
                "score": {"$gte": min},
                "$limit": limit,
                "$skip": skip,
            }))))
            .unwrap();

        prop_assert_eq!(response.total, expected);
        prop_assert_eq!(response.data.len(), limit.min(expected.saturating_sub(skip)));
        prop_assert!(response.total >= response.data.len());
    }

    #[test]
    fn sort_is_stable(scores in scores(), descending in any::<bool>()) {
        let store = store_of(&scores);
        let direction = if descending { -1 } else { 1 };
        let data = store
            .find_in_store(&Params::from_query(rec(json!({"$sort": {"score": direction}}))))
            .unwrap()
            .data;

        for pair in data.windows(2) {
            let (a, b) = (pair[0]["score"].as_i64().unwrap(), pair[1]["score"].as_i64().unwrap());
            if descending {
                prop_assert!(a >= b);
            } else {
                prop_assert!(a <= b);
            }
            if a == b {
                prop_assert!(pair[0]["id"].as_u64().unwrap() < pair[1]["id"].as_u64().unwrap());
            }
        }
    }

    #[test]
    fn reset_restores_canonical_fields(
        fields in prop::collection::btree_map("[a-z]{1,5}", json_value(), 0..6),
        edited in prop::collection::vec(any::<bool>(), 6),
    ) {
        let store = Store::local("docs").unwrap();
        let mut origin: Record = fields.into_iter().filter(|(key, _)| key != "id").collect();
        origin.insert("id".into(), json!(1));
        let original = store.add_or_update(origin).unwrap();

        let mut clone = store.clone_record(&original, None, true).unwrap();
        let keys: Vec<String> = clone
            .keys()
            .filter(|key| key.as_str() != "id" && key.as_str() != CLONE_FLAG)
            .cloned()
            .collect();
        for (key, edit) in keys.iter().zip(&edited) {
            if *edit {
                edit_deep(clone.get_mut(key).expect("key just listed"));
            }
        }
        clone.insert("stale".into(), json!({"nested": [1, 2]}));
        store.save_clone(clone).unwrap();

        let mut reset = store.reset_clone(&original, None).unwrap();
        prop_assert_eq!(reset.remove(CLONE_FLAG), Some(json!(true)));
        prop_assert_eq!(&reset, &original);
        prop_assert_eq!(store.items().get_item("1").unwrap(), original);
    }
}
