// pipelite-core/src/value_property_tests.rs
// Property tests for the value model's ordering and hashing contracts

use crate::collation::Collator;
use crate::document::DocumentBuilder;
use crate::value::Value;
use proptest::prelude::*;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

fn leaf_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Missing),
        Just(Value::Null),
        Just(Value::MinKey),
        Just(Value::MaxKey),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::Int32),
        any::<i64>().prop_map(Value::Int64),
        // Includes NaN, infinities and signed zeros
        any::<f64>().prop_map(Value::Double),
        "[a-zA-Z0-9]{0,8}".prop_map(Value::String),
        any::<i64>().prop_map(Value::Date),
        any::<u64>().prop_map(Value::Timestamp),
    ]
}

fn arb_value() -> impl Strategy<Value = Value> {
    leaf_value().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::array),
            prop::collection::vec(("[a-z]{1,4}", inner), 0..4).prop_map(|fields| {
                let mut b = DocumentBuilder::new();
                for (k, v) in fields {
                    b.set(&k, v);
                }
                Value::object(b.freeze())
            }),
        ]
    })
}

fn hash_of(v: &Value, collator: Option<&Collator>) -> u64 {
    let mut h = DefaultHasher::new();
    v.hash_with(&mut h, collator);
    h.finish()
}

proptest! {
    #[test]
    fn prop_compare_is_antisymmetric(a in arb_value(), b in arb_value()) {
        let ab = Value::compare(&a, &b, None);
        let ba = Value::compare(&b, &a, None);
        prop_assert_eq!(ab, ba.reverse());
    }

    #[test]
    fn prop_compare_is_reflexive(a in arb_value()) {
        prop_assert_eq!(Value::compare(&a, &a, None), Ordering::Equal);
    }

    #[test]
    fn prop_compare_is_transitive(a in arb_value(), b in arb_value(), c in arb_value()) {
        // Sort the three values by the comparator, then verify the
        // chain holds pairwise
        let mut sorted = vec![a, b, c];
        sorted.sort_by(|x, y| Value::compare(x, y, None));
        prop_assert_ne!(Value::compare(&sorted[0], &sorted[1], None), Ordering::Greater);
        prop_assert_ne!(Value::compare(&sorted[1], &sorted[2], None), Ordering::Greater);
        prop_assert_ne!(Value::compare(&sorted[0], &sorted[2], None), Ordering::Greater);
    }

    #[test]
    fn prop_equal_values_hash_equal(a in arb_value(), b in arb_value()) {
        if Value::compare(&a, &b, None) == Ordering::Equal {
            prop_assert_eq!(hash_of(&a, None), hash_of(&b, None));
        }
    }

    #[test]
    fn prop_equal_values_hash_equal_under_collation(a in arb_value(), b in arb_value()) {
        let ci = Collator::case_insensitive();
        if Value::compare(&a, &b, Some(&ci)) == Ordering::Equal {
            prop_assert_eq!(hash_of(&a, Some(&ci)), hash_of(&b, Some(&ci)));
        }
    }

    #[test]
    fn prop_equal_values_report_equal_sizes(a in arb_value(), b in arb_value()) {
        if Value::compare(&a, &b, None) == Ordering::Equal {
            prop_assert_eq!(a.approximate_size(), b.approximate_size());
        }
    }

    #[test]
    fn prop_numeric_cross_type_agrees_with_math(i in any::<i32>(), d in -1.0e6f64..1.0e6) {
        let ord = Value::compare(&Value::Int32(i), &Value::Double(d), None);
        let expected = (i as f64).partial_cmp(&d).unwrap();
        prop_assert_eq!(ord, expected);
    }

    #[test]
    fn prop_optimize_is_idempotent_on_random_ranges(
        lo in -100i64..100,
        hi in -100i64..100,
    ) {
        use crate::matcher::MatchExpression;
        let filter = serde_json::json!({
            "$and": [
                {"a": {"$gte": lo}},
                {"$and": [{"a": {"$lt": hi}}, {"b": {"$exists": true}}]}
            ]
        });
        let once = MatchExpression::parse(&filter).unwrap().optimize();
        let twice = once.clone().optimize();
        prop_assert!(MatchExpression::equivalent(&once, &twice));
    }
}
