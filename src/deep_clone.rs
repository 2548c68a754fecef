//! Structural deep cloning.
//!
//! The cache invokes [`clone_value`] on every set and every get so that
//! callers and the store never observe each other's mutations through
//! shared nodes. An identity map scoped to a single call preserves
//! aliasing between shared nodes and terminates cycles.

use std::collections::HashMap;

use crate::value::{SharedValue, Value};

/// Produce a structurally independent copy of `value`.
///
/// Mutating the result through any [`SharedValue`] it contains is not
/// observable via the original, and vice versa. Aliasing inside the
/// value is preserved: two shared nodes pointing at the same cell clone
/// to two nodes pointing at the same fresh cell.
pub fn clone_value(value: &Value) -> Value {
    let mut seen: HashMap<usize, SharedValue> = HashMap::new();
    clone_inner(value, &mut seen)
}

fn clone_inner(value: &Value, seen: &mut HashMap<usize, SharedValue>) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(v) => Value::Bool(*v),
        Value::Int16(v) => Value::Int16(*v),
        Value::Int32(v) => Value::Int32(*v),
        Value::Int(v) => Value::Int(*v),
        Value::Float(v) => Value::Float(*v),
        Value::Time(v) => Value::Time(*v),
        Value::Id(v) => Value::Id(*v),
        Value::Str(v) => Value::Str(v.clone()),
        Value::Bytes(v) => Value::Bytes(v.clone()),
        Value::Seq(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(clone_inner(item, seen));
            }
            Value::Seq(out)
        }
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(key, entry)| (key.clone(), clone_inner(entry, seen)))
                .collect(),
        ),
        Value::Shared(shared) => {
            if let Some(existing) = seen.get(&shared.ptr_id()) {
                return Value::Shared(existing.clone());
            }
            // Register the fresh cell before descending so cycles
            // resolve to it instead of recursing forever.
            let fresh = SharedValue::new(Value::Null);
            seen.insert(shared.ptr_id(), fresh.clone());
            let snapshot = shared.get();
            let cloned = clone_inner(&snapshot, seen);
            fresh.set(cloned);
            Value::Shared(fresh)
        }
        // The buffer is immutable, sharing it is safe.
        Value::Opaque(opaque) => Value::Opaque(opaque.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_clone_is_structurally_equal() {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), Value::Int(1));
        map.insert(
            "tags".to_string(),
            Value::shared(Value::Seq(vec![Value::from("a"), Value::from("b")])),
        );
        let original = Value::Map(map);
        assert_eq!(clone_value(&original), original);
    }

    #[test]
    fn test_clone_isolates_shared_mutation() {
        let original = Value::shared(Value::Seq(vec![Value::from("a")]));
        let copy = clone_value(&original);
        if let Value::Shared(cell) = &copy {
            cell.update(|inner| {
                if let Value::Seq(items) = inner {
                    items.push(Value::from("b"));
                }
            });
        }
        assert_eq!(original, Value::shared(Value::Seq(vec![Value::from("a")])));
    }

    #[test]
    fn test_clone_preserves_aliasing() {
        let shared = SharedValue::new(Value::Int(1));
        let original = Value::Seq(vec![
            Value::Shared(shared.clone()),
            Value::Shared(shared),
        ]);
        let copy = clone_value(&original);
        if let Value::Seq(items) = &copy {
            let (Value::Shared(a), Value::Shared(b)) = (&items[0], &items[1]) else {
                panic!("expected shared nodes");
            };
            assert!(a.ptr_eq(b));
            a.set(Value::Int(2));
            assert_eq!(b.get(), Value::Int(2));
        } else {
            panic!("expected sequence");
        }
    }

    mod properties {
        use super::*;
        use crate::size::SizeCalculator;
        use proptest::prelude::*;

        fn leaf() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i64>().prop_map(Value::Int),
                (-1.0e12f64..1.0e12).prop_map(Value::Float),
                "[a-z0-9 ]{0,12}".prop_map(Value::from),
            ]
        }

        fn tree() -> impl Strategy<Value = Value> {
            leaf().prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Seq),
                    proptest::collection::btree_map("[a-z]{1,4}", inner.clone(), 0..4)
                        .prop_map(Value::Map),
                    inner.prop_map(Value::shared),
                ]
            })
        }

        proptest! {
            #[test]
            fn clone_preserves_structure(value in tree()) {
                prop_assert_eq!(clone_value(&value), value);
            }

            #[test]
            fn measuring_a_clone_matches_the_original(value in tree()) {
                let calculator = SizeCalculator::new();
                let original = calculator.measure(&value).unwrap();
                let copied = calculator.measure(&clone_value(&value)).unwrap();
                prop_assert_eq!(original, copied);
            }
        }
    }

    #[test]
    fn test_clone_terminates_on_cycles() {
        let shared = SharedValue::new(Value::Null);
        shared.set(Value::Seq(vec![Value::Shared(shared.clone()), Value::Int(9)]));
        let cyclic = Value::Shared(shared.clone());
        let copy = clone_value(&cyclic);
        let Value::Shared(copied) = &copy else {
            panic!("expected shared node");
        };
        // The copy is a distinct cell whose cycle points back at itself.
        assert!(!copied.ptr_eq(&shared));
        let inner = copied.get();
        let Value::Seq(items) = inner else {
            panic!("expected sequence");
        };
        let Value::Shared(back) = &items[0] else {
            panic!("expected shared node");
        };
        assert!(back.ptr_eq(copied));
        assert_eq!(items[1], Value::Int(9));
    }
}
