// pipelite-core/src/matcher/algo.rs
// Implication reasoning between match expressions
//
// is_subset_of(lhs, rhs) answers "does every document matched by lhs
// also match rhs?". The procedure is deliberately conservative: it
// enumerates exactly the cases proven sound and returns false for
// everything else. A wrong `false` costs an optimization; a wrong
// `true` is a correctness bug.

use super::{compare_leaf, ComparisonOp, MatchExpression};
use crate::value::Value;
use std::cmp::Ordering;

/// Conservative implication check.
pub fn is_subset_of(lhs: &MatchExpression, rhs: &MatchExpression) -> bool {
    // Trivial cases first
    if matches!(rhs, MatchExpression::AlwaysTrue) {
        return true;
    }
    if matches!(lhs, MatchExpression::AlwaysFalse) {
        return true;
    }
    if MatchExpression::equivalent(lhs, rhs) {
        return true;
    }

    // rhs AND: lhs must be a subset of every conjunct
    if let MatchExpression::And(conjuncts) = rhs {
        return conjuncts.iter().all(|c| is_subset_of(lhs, c));
    }

    // lhs OR: every branch must be a subset of rhs
    if let MatchExpression::Or(branches) = lhs {
        return branches.iter().all(|b| is_subset_of(b, rhs));
    }

    // lhs AND: at least one conjunct being a subset suffices
    if let MatchExpression::And(conjuncts) = lhs {
        return conjuncts.iter().any(|c| is_subset_of(c, rhs));
    }

    // rhs OR: lhs being a subset of one branch suffices
    if let MatchExpression::Or(branches) = rhs {
        return branches.iter().any(|b| is_subset_of(lhs, b));
    }

    match (lhs, rhs) {
        // $in decomposes to per-equality reasoning
        (MatchExpression::In { path, values, collator, .. }, _) => {
            if values.is_empty() {
                // Matches nothing, subset of everything
                return true;
            }
            values.iter().all(|v| {
                let eq = MatchExpression::Comparison {
                    path: path.clone(),
                    op: ComparisonOp::Eq,
                    value: v.clone(),
                    collator: collator.clone(),
                    tag: None,
                };
                is_subset_of(&eq, rhs)
            })
        }

        (
            MatchExpression::Comparison { path, op, value, collator, .. },
            MatchExpression::In {
                path: rhs_path,
                values: rhs_values,
                collator: rhs_collator,
                ..
            },
        ) => {
            // Equality is a subset of $in when the value is a member
            path == rhs_path
                && *op == ComparisonOp::Eq
                && collators_compatible(collator, rhs_collator, value)
                && rhs_values
                    .iter()
                    .any(|t| compare_leaf(ComparisonOp::Eq, t, value, rhs_collator.as_deref())
                        || (t.is_nan() && value.is_nan()))
        }

        (lhs_cmp @ MatchExpression::Comparison { .. }, rhs_cmp @ MatchExpression::Comparison { .. }) => {
            comparison_subset(lhs_cmp, rhs_cmp)
        }

        // Null-intolerant predicates imply $exists: true
        (_, MatchExpression::Exists { path: rhs_path }) => {
            implies_exists(lhs, rhs_path)
        }

        _ => false,
    }
}

fn comparison_subset(lhs: &MatchExpression, rhs: &MatchExpression) -> bool {
    let (MatchExpression::Comparison {
        path: lp,
        op: lop,
        value: lv,
        collator: lc,
        ..
    }, MatchExpression::Comparison {
        path: rp,
        op: rop,
        value: rv,
        collator: rc,
        ..
    }) = (lhs, rhs) else {
        return false;
    };

    if lp != rp {
        return false;
    }

    // NaN is subset-comparable only to NaN-matching equality shapes
    if lv.is_nan() || rv.is_nan() {
        let l_is_nan_eq = lv.is_nan() && matches!(lop, ComparisonOp::Eq);
        let r_matches_nan = rv.is_nan()
            && matches!(rop, ComparisonOp::Eq | ComparisonOp::Gte | ComparisonOp::Lte);
        return l_is_nan_eq && r_matches_nan;
    }

    // Null equality reasoning: {a: null} also matches missing, so it
    // only implies other null-equality predicates
    if lv.is_null() || rv.is_null() {
        let l_null_eq = lv.is_null() && matches!(lop, ComparisonOp::Eq);
        let r_null_eq = rv.is_null()
            && matches!(rop, ComparisonOp::Eq | ComparisonOp::Gte | ComparisonOp::Lte);
        return l_null_eq && r_null_eq;
    }

    // Comparisons never match across type brackets; mixed brackets
    // mean disjoint ranges and no proven implication
    if lv.canonical_order() != rv.canonical_order() {
        return false;
    }

    if !collators_compatible(lc, rc, lv) {
        return false;
    }

    let ord = Value::compare(lv, rv, rc.as_deref());
    use ComparisonOp::*;
    match (lop, rop) {
        (Eq, Eq) => ord == Ordering::Equal,
        (Eq, Gt) => ord == Ordering::Greater,
        (Eq, Gte) => ord != Ordering::Less,
        (Eq, Lt) => ord == Ordering::Less,
        (Eq, Lte) => ord != Ordering::Greater,
        (Gt, Gt) | (Gt, Gte) => ord != Ordering::Less,
        (Gte, Gt) => ord == Ordering::Greater,
        (Gte, Gte) => ord != Ordering::Less,
        (Lt, Lt) | (Lt, Lte) => ord != Ordering::Greater,
        (Lte, Lt) => ord == Ordering::Less,
        (Lte, Lte) => ord != Ordering::Greater,
        _ => false,
    }
}

/// lhs implies `$exists: true` on `path` when it cannot match a
/// document where the path is missing.
fn implies_exists(lhs: &MatchExpression, path: &str) -> bool {
    match lhs {
        MatchExpression::Comparison {
            path: lp, value, ..
        } => lp == path && !value.is_null(),
        MatchExpression::In {
            path: lp, values, ..
        } => lp == path && !values.is_empty() && !values.iter().any(Value::is_null),
        MatchExpression::Exists { path: lp } => lp == path,
        MatchExpression::Size { path: lp, .. }
        | MatchExpression::All { path: lp, .. }
        | MatchExpression::ElemMatch { path: lp, .. }
        | MatchExpression::Mod { path: lp, .. }
        | MatchExpression::Regex { path: lp, .. } => lp == path,
        _ => false,
    }
}

/// String comparisons are only transferable between identical
/// collations; non-string values don't care.
fn collators_compatible(
    lhs: &Option<std::sync::Arc<crate::collation::Collator>>,
    rhs: &Option<std::sync::Arc<crate::collation::Collator>>,
    value: &Value,
) -> bool {
    let string_involved = matches!(value, Value::String(_) | Value::Array(_) | Value::Object(_));
    if !string_involved {
        return true;
    }
    match (lhs, rhs) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(filter: serde_json::Value) -> MatchExpression {
        MatchExpression::parse(&filter).unwrap()
    }

    fn subset(lhs: serde_json::Value, rhs: serde_json::Value) -> bool {
        is_subset_of(&parse(lhs), &parse(rhs))
    }

    #[test]
    fn test_point_inside_range() {
        assert!(subset(json!({"a": {"$eq": 5}}), json!({"a": {"$gte": 0}})));
        assert!(subset(json!({"a": {"$eq": 5}}), json!({"a": {"$lt": 10}})));
        assert!(!subset(json!({"a": {"$eq": 5}}), json!({"a": {"$gt": 5}})));
        assert!(subset(json!({"a": {"$eq": 5}}), json!({"a": {"$gte": 5}})));
    }

    #[test]
    fn test_range_inside_range() {
        assert!(subset(json!({"a": {"$gt": 10}}), json!({"a": {"$gt": 5}})));
        assert!(subset(json!({"a": {"$gt": 5}}), json!({"a": {"$gt": 5}})));
        assert!(!subset(json!({"a": {"$gt": 5}}), json!({"a": {"$gt": 10}})));
        assert!(subset(json!({"a": {"$gte": 6}}), json!({"a": {"$gt": 5}})));
        assert!(!subset(json!({"a": {"$gte": 5}}), json!({"a": {"$gt": 5}})));
        assert!(subset(json!({"a": {"$lt": 5}}), json!({"a": {"$lte": 5}})));
        assert!(!subset(json!({"a": {"$lte": 5}}), json!({"a": {"$lt": 5}})));
    }

    #[test]
    fn test_different_paths_never_imply() {
        assert!(!subset(json!({"a": {"$eq": 5}}), json!({"b": {"$gte": 0}})));
    }

    #[test]
    fn test_nan_cases() {
        // json! can't carry NaN; build the NaN trees directly.
        // NaN never sits inside an ordered range, in either direction.
        let nan_eq = MatchExpression::Comparison {
            path: "a".into(),
            op: ComparisonOp::Eq,
            value: Value::Double(f64::NAN),
            collator: None,
            tag: None,
        };
        let gte0 = parse(json!({"a": {"$gte": 0}}));
        assert!(!is_subset_of(&nan_eq, &gte0));
        assert!(!is_subset_of(&gte0, &nan_eq));
        assert!(is_subset_of(&nan_eq, &nan_eq.clone()));
    }

    #[test]
    fn test_in_decomposition() {
        assert!(subset(json!({"a": {"$in": [1, 2]}}), json!({"a": {"$gte": 1}})));
        assert!(!subset(json!({"a": {"$in": [0, 2]}}), json!({"a": {"$gte": 1}})));
        assert!(subset(json!({"a": {"$in": []}}), json!({"a": {"$gt": 100}})));
        assert!(subset(json!({"a": {"$eq": 2}}), json!({"a": {"$in": [1, 2]}})));
        assert!(subset(json!({"a": {"$in": [1, 2]}}), json!({"a": {"$in": [0, 1, 2]}})));
    }

    #[test]
    fn test_and_decomposition() {
        // rhs AND: subset of every conjunct
        assert!(subset(
            json!({"a": {"$eq": 5}}),
            json!({"a": {"$gte": 0, "$lte": 10}})
        ));
        assert!(!subset(
            json!({"a": {"$eq": 50}}),
            json!({"a": {"$gte": 0, "$lte": 10}})
        ));
        // lhs AND: one conjunct subset suffices
        assert!(subset(
            json!({"a": {"$gt": 10}, "b": 1}),
            json!({"a": {"$gt": 5}})
        ));
    }

    #[test]
    fn test_or_decomposition() {
        assert!(subset(
            json!({"$or": [{"a": {"$eq": 1}}, {"a": {"$eq": 2}}]}),
            json!({"a": {"$gte": 0}})
        ));
        assert!(!subset(
            json!({"$or": [{"a": {"$eq": 1}}, {"a": {"$eq": -2}}]}),
            json!({"a": {"$gte": 0}})
        ));
        assert!(subset(
            json!({"a": {"$eq": 1}}),
            json!({"$or": [{"a": {"$gte": 0}}, {"b": 1}]})
        ));
    }

    #[test]
    fn test_exists_implication() {
        assert!(subset(json!({"a": {"$eq": 5}}), json!({"a": {"$exists": true}})));
        assert!(subset(json!({"a": {"$gt": 0}}), json!({"a": {"$exists": true}})));
        assert!(subset(
            json!({"a": {"$in": [1, 2]}}),
            json!({"a": {"$exists": true}})
        ));
        // Null equality matches missing, so it proves nothing
        assert!(!subset(json!({"a": null}), json!({"a": {"$exists": true}})));
        assert!(!subset(
            json!({"a": {"$in": [1, null]}}),
            json!({"a": {"$exists": true}})
        ));
    }

    #[test]
    fn test_null_equality_parity() {
        assert!(subset(json!({"a": null}), json!({"a": null})));
        assert!(subset(json!({"a": {"$in": [null]}}), json!({"a": null})));
        assert!(!subset(json!({"a": {"$in": [null, 2]}}), json!({"a": null})));
        assert!(!subset(json!({"a": null}), json!({"a": {"$gte": 0}})));
    }

    #[test]
    fn test_cross_bracket_is_conservative() {
        assert!(!subset(json!({"a": {"$eq": "5"}}), json!({"a": {"$gte": 0}})));
        assert!(!subset(json!({"a": {"$eq": 5}}), json!({"a": {"$gte": ""}})));
    }

    #[test]
    fn test_unhandled_shapes_default_false() {
        assert!(!subset(json!({"a": {"$size": 2}}), json!({"a": {"$size": 2}, "b": 1})));
        assert!(!subset(json!({"a": {"$regex": "x"}}), json!({"a": {"$gt": ""}})));
        // But identical trees are always subsets
        assert!(subset(json!({"a": {"$size": 2}}), json!({"a": {"$size": 2}})));
    }

    #[test]
    fn test_always_true_false() {
        assert!(subset(json!({"a": 1}), json!({})));
        let af = MatchExpression::AlwaysFalse;
        assert!(is_subset_of(&af, &parse(json!({"a": 1}))));
    }
}
