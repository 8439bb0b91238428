//! Flat, key-level diff between two state snapshots.
//!
//! Only top-level keys are compared. A change anywhere inside a nested
//! value marks the whole top-level key as modified.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::state::State;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    /// Keys only in the newer state, with the newer value.
    pub added: State,
    /// Keys only in the older state, with the older value.
    pub removed: State,
    /// Keys in both with structurally different values, with the newer value.
    pub modified: State,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Compute `before -> after`. Equality is structural with numbers compared
/// by value, so `1` equals `1.0` and key order inside objects is ignored.
pub fn diff(before: &State, after: &State) -> StateDiff {
    let mut out = StateDiff::default();

    for (key, old) in before {
        match after.get(key) {
            None => {
                out.removed.insert(key.clone(), old.clone());
            }
            Some(new) if !same_value(old, new) => {
                out.modified.insert(key.clone(), new.clone());
            }
            Some(_) => {}
        }
    }

    for (key, new) in after {
        if !before.contains_key(key) {
            out.added.insert(key.clone(), new.clone());
        }
    }

    out
}

/// JSON equality where an integer and a float with the same value match.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => same_number(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| same_value(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, a)| y.get(key).is_some_and(|b| same_value(a, b)))
        }
        _ => a == b,
    }
}

fn same_number(x: &Number, y: &Number) -> bool {
    if x.is_f64() || y.is_f64() {
        x.as_f64() == y.as_f64()
    } else {
        x == y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn state(v: Value) -> State {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn research_agent_step() {
        let cp0 = state(json!({"step_count": 0, "query": "a"}));
        let cp1 = state(json!({"step_count": 1, "query": "a", "result": "x"}));
        let d = diff(&cp0, &cp1);
        assert_eq!(d.added, state(json!({"result": "x"})));
        assert!(d.removed.is_empty());
        assert_eq!(d.modified, state(json!({"step_count": 1})));
    }

    #[test]
    fn nested_change_marks_top_level_key() {
        let a = state(json!({"plan": {"steps": [1, 2], "done": false}}));
        let b = state(json!({"plan": {"steps": [1, 2], "done": true}}));
        let d = diff(&a, &b);
        assert_eq!(d.modified.get("plan"), Some(&json!({"steps": [1, 2], "done": true})));
        assert!(d.added.is_empty() && d.removed.is_empty());
    }

    #[test]
    fn equal_nested_values_are_omitted() {
        let a = state(json!({"cfg": {"x": 1, "y": [true, null]}}));
        let b = state(json!({"cfg": {"y": [true, null], "x": 1}}));
        assert!(diff(&a, &b).is_empty());
    }

    #[test]
    fn integer_and_float_forms_are_equal() {
        let a = state(json!({"n": 1, "xs": [2, {"y": 3}], "big": u64::MAX}));
        let b = state(json!({"n": 1.0, "xs": [2.0, {"y": 3.0}], "big": u64::MAX}));
        assert!(diff(&a, &b).is_empty());

        let c = state(json!({"n": 1.5, "xs": [2, {"y": 3}], "big": u64::MAX - 1}));
        let d = diff(&a, &c);
        assert_eq!(d.modified, state(json!({"n": 1.5, "big": u64::MAX - 1})));
    }

    #[test]
    fn removed_carries_old_value() {
        let a = state(json!({"keep": 1, "gone": "bye"}));
        let b = state(json!({"keep": 1}));
        let d = diff(&a, &b);
        assert_eq!(d.removed, state(json!({"gone": "bye"})));
    }

    #[test]
    fn null_value_is_present_not_absent() {
        let a = state(json!({"k": null}));
        let b = State::new();
        assert_eq!(diff(&a, &b).removed.get("k"), Some(&Value::Null));
        assert_eq!(diff(&b, &a).added.get("k"), Some(&Value::Null));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn leaf() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                (-50i64..50).prop_map(|n| json!(n)),
                "[a-c]{0,3}".prop_map(Value::String),
            ]
        }

        fn value() -> impl Strategy<Value = Value> {
            leaf().prop_recursive(2, 8, 3, |inner| {
                prop_oneof![
                    proptest::collection::vec(inner.clone(), 0..3).prop_map(Value::Array),
                    proptest::collection::btree_map("[x-z]", inner, 0..3)
                        .prop_map(|m| Value::Object(m.into_iter().collect())),
                ]
            })
        }

        fn any_state() -> impl Strategy<Value = State> {
            proptest::collection::btree_map("[a-f]", value(), 0..6)
                .prop_map(|m| m.into_iter().collect())
        }

        proptest! {
            #[test]
            fn added_and_removed_are_disjoint(a in any_state(), b in any_state()) {
                let d = diff(&a, &b);
                for key in d.added.keys() {
                    prop_assert!(!d.removed.contains_key(key));
                }
            }

            #[test]
            fn diff_with_self_is_empty(a in any_state()) {
                prop_assert!(diff(&a, &a).is_empty());
            }

            #[test]
            fn reversed_diff_swaps_sides(a in any_state(), b in any_state()) {
                let forward = diff(&a, &b);
                let backward = diff(&b, &a);
                prop_assert_eq!(&forward.added, &backward.removed);
                prop_assert_eq!(&forward.removed, &backward.added);

                let fwd_keys: Vec<_> = forward.modified.keys().collect();
                let bwd_keys: Vec<_> = backward.modified.keys().collect();
                prop_assert_eq!(fwd_keys, bwd_keys);
                for (key, new) in &forward.modified {
                    prop_assert_eq!(Some(new), b.get(key));
                    prop_assert_eq!(backward.modified.get(key), a.get(key));
                }
            }

            #[test]
            fn every_key_is_accounted_for(a in any_state(), b in any_state()) {
                let d = diff(&a, &b);
                for key in a.keys().chain(b.keys()) {
                    let changed = d.added.contains_key(key)
                        || d.removed.contains_key(key)
                        || d.modified.contains_key(key);
                    prop_assert_eq!(changed, a.get(key) != b.get(key));
                }
            }
        }
    }
}
