// pipelite-core/src/matcher.rs
// Match expression trees: parse, evaluate, optimize, serialize
//
// The filter language follows the MongoDB query format: implicit
// top-level AND over field conditions, logical combinators, and
// per-field operator objects. Parsing is strict; evaluation never
// fails for well-typed input.

pub mod algo;

use crate::collation::Collator;
use crate::document::Document;
use crate::error::{PipeLiteError, Result};
use crate::expression::Expression;
use crate::value::{Value, ValueComparator};
use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

// ============================================================================
// REGEX CACHE
// ============================================================================

lazy_static! {
    /// Cache for compiled regex patterns, keyed "pattern:options".
    /// Regex compilation is expensive; 100 entries bound the memory.
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(100).unwrap()));
}

/// Convert MongoDB-style options (i, m, s, x) to inline regex flags.
fn build_regex_pattern(pattern: &str, options: &str) -> String {
    let valid: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();
    if valid.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", valid, pattern)
    }
}

fn get_or_compile_regex(pattern: &str, options: &str) -> Result<Regex> {
    let cache_key = format!("{}:{}", pattern, options);
    {
        let mut cache = REGEX_CACHE.lock();
        if let Some(regex) = cache.get(&cache_key) {
            return Ok(regex.clone());
        }
    }
    let regex = Regex::new(&build_regex_pattern(pattern, options)).map_err(|e| {
        PipeLiteError::InvalidQuery(format!("invalid regex pattern '{}': {}", pattern, e))
    })?;
    REGEX_CACHE.lock().put(cache_key, regex.clone());
    Ok(regex)
}

// ============================================================================
// TREE MODEL
// ============================================================================

/// Node-kind tag; one per concrete node shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    And,
    Or,
    Nor,
    Not,
    AlwaysTrue,
    AlwaysFalse,
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Exists,
    Type,
    Size,
    Mod,
    Regex,
    All,
    ElemMatch,
    Expr,
}

/// Comparison operator carried by a comparison leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ComparisonOp {
    pub fn name(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "$eq",
            ComparisonOp::Gt => "$gt",
            ComparisonOp::Gte => "$gte",
            ComparisonOp::Lt => "$lt",
            ComparisonOp::Lte => "$lte",
        }
    }
}

/// Opaque tag slot for external index-selection logic; the engine
/// round-trips it untouched.
pub type TagData = Arc<dyn std::any::Any + Send + Sync>;

/// A predicate over documents.
///
/// Logical nodes have children and no path; leaves carry a field path
/// (empty only inside value-form $elemMatch) and a collator installed
/// via [`MatchExpression::set_collator`].
#[derive(Clone)]
pub enum MatchExpression {
    And(Vec<MatchExpression>),
    Or(Vec<MatchExpression>),
    Nor(Vec<MatchExpression>),
    Not(Box<MatchExpression>),
    AlwaysTrue,
    AlwaysFalse,
    Comparison {
        path: String,
        op: ComparisonOp,
        value: Value,
        collator: Option<Arc<Collator>>,
        tag: Option<TagData>,
    },
    In {
        path: String,
        values: Vec<Value>,
        collator: Option<Arc<Collator>>,
        tag: Option<TagData>,
    },
    Exists {
        path: String,
    },
    Type {
        path: String,
        type_name: String,
    },
    Size {
        path: String,
        size: i64,
    },
    Mod {
        path: String,
        divisor: i64,
        remainder: i64,
    },
    Regex {
        path: String,
        pattern: String,
        options: String,
    },
    All {
        path: String,
        values: Vec<Value>,
        collator: Option<Arc<Collator>>,
    },
    ElemMatch {
        path: String,
        inner: Box<MatchExpression>,
        /// true: operators applied to the element value itself;
        /// false: element must be an object matching `inner`
        value_form: bool,
    },
    Expr {
        expression: Expression,
        collator: Option<Arc<Collator>>,
    },
}

impl std::fmt::Debug for MatchExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MatchExpression({})", self.serialize())
    }
}

impl MatchExpression {
    pub fn match_type(&self) -> MatchType {
        match self {
            MatchExpression::And(_) => MatchType::And,
            MatchExpression::Or(_) => MatchType::Or,
            MatchExpression::Nor(_) => MatchType::Nor,
            MatchExpression::Not(_) => MatchType::Not,
            MatchExpression::AlwaysTrue => MatchType::AlwaysTrue,
            MatchExpression::AlwaysFalse => MatchType::AlwaysFalse,
            MatchExpression::Comparison { op, .. } => match op {
                ComparisonOp::Eq => MatchType::Eq,
                ComparisonOp::Gt => MatchType::Gt,
                ComparisonOp::Gte => MatchType::Gte,
                ComparisonOp::Lt => MatchType::Lt,
                ComparisonOp::Lte => MatchType::Lte,
            },
            MatchExpression::In { .. } => MatchType::In,
            MatchExpression::Exists { .. } => MatchType::Exists,
            MatchExpression::Type { .. } => MatchType::Type,
            MatchExpression::Size { .. } => MatchType::Size,
            MatchExpression::Mod { .. } => MatchType::Mod,
            MatchExpression::Regex { .. } => MatchType::Regex,
            MatchExpression::All { .. } => MatchType::All,
            MatchExpression::ElemMatch { .. } => MatchType::ElemMatch,
            MatchExpression::Expr { .. } => MatchType::Expr,
        }
    }

    /// Field path, empty for purely logical nodes.
    pub fn path(&self) -> &str {
        match self {
            MatchExpression::Comparison { path, .. }
            | MatchExpression::In { path, .. }
            | MatchExpression::Exists { path }
            | MatchExpression::Type { path, .. }
            | MatchExpression::Size { path, .. }
            | MatchExpression::Mod { path, .. }
            | MatchExpression::Regex { path, .. }
            | MatchExpression::All { path, .. }
            | MatchExpression::ElemMatch { path, .. } => path,
            _ => "",
        }
    }

    pub fn num_children(&self) -> usize {
        match self {
            MatchExpression::And(c) | MatchExpression::Or(c) | MatchExpression::Nor(c) => c.len(),
            MatchExpression::Not(_) => 1,
            MatchExpression::ElemMatch { .. } => 1,
            _ => 0,
        }
    }

    pub fn child(&self, i: usize) -> Option<&MatchExpression> {
        match self {
            MatchExpression::And(c) | MatchExpression::Or(c) | MatchExpression::Nor(c) => c.get(i),
            MatchExpression::Not(inner) if i == 0 => Some(inner),
            MatchExpression::ElemMatch { inner, .. } if i == 0 => Some(inner),
            _ => None,
        }
    }

    /// Attach or replace the opaque index tag on a leaf.
    pub fn set_tag(&mut self, data: TagData) {
        match self {
            MatchExpression::Comparison { tag, .. } | MatchExpression::In { tag, .. } => {
                *tag = Some(data)
            }
            _ => {}
        }
    }

    pub fn tag(&self) -> Option<&TagData> {
        match self {
            MatchExpression::Comparison { tag, .. } | MatchExpression::In { tag, .. } => {
                tag.as_ref()
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Parsing
    // ------------------------------------------------------------------

    /// Parse a filter document. An empty filter is `AlwaysTrue`.
    pub fn parse(filter: &serde_json::Value) -> Result<MatchExpression> {
        let obj = filter.as_object().ok_or_else(|| {
            PipeLiteError::InvalidQuery("filter must be an object".to_string())
        })?;
        if obj.is_empty() {
            return Ok(MatchExpression::AlwaysTrue);
        }

        let mut clauses = Vec::new();
        for (key, value) in obj {
            if key.starts_with('$') {
                clauses.push(Self::parse_top_level_operator(key, value)?);
            } else {
                clauses.extend(Self::parse_field_condition(key, value)?);
            }
        }
        Ok(if clauses.len() == 1 {
            clauses.pop().unwrap()
        } else {
            MatchExpression::And(clauses)
        })
    }

    fn parse_top_level_operator(
        name: &str,
        value: &serde_json::Value,
    ) -> Result<MatchExpression> {
        match name {
            "$and" | "$or" | "$nor" => {
                let arr = value.as_array().ok_or_else(|| {
                    PipeLiteError::InvalidQuery(format!("{} requires an array", name))
                })?;
                if arr.is_empty() {
                    return Err(PipeLiteError::InvalidQuery(format!(
                        "{} requires a nonempty array",
                        name
                    )));
                }
                let children = arr
                    .iter()
                    .map(MatchExpression::parse)
                    .collect::<Result<Vec<_>>>()?;
                Ok(match name {
                    "$and" => MatchExpression::And(children),
                    "$or" => MatchExpression::Or(children),
                    _ => MatchExpression::Nor(children),
                })
            }
            "$expr" => Ok(MatchExpression::Expr {
                expression: Expression::parse(value)?,
                collator: None,
            }),
            other => Err(PipeLiteError::UnknownOperator(other.to_string())),
        }
    }

    /// A field condition is either a direct equality or an object of
    /// operators. `{a: {$gt: 1, $lt: 5}}` produces two clauses.
    fn parse_field_condition(
        path: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<MatchExpression>> {
        let op_obj = match value.as_object() {
            Some(map)
                if map.keys().any(|k| k.starts_with('$'))
                    && !is_extended_json_wrapper(map) =>
            {
                map
            }
            _ => {
                // Direct equality ({name: "Alice"} or equality-to-document)
                return Ok(vec![MatchExpression::Comparison {
                    path: path.to_string(),
                    op: ComparisonOp::Eq,
                    value: Value::from_json(value),
                    collator: None,
                    tag: None,
                }]);
            }
        };

        let mut out = Vec::new();
        let regex_options = op_obj
            .get("$options")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        for (op_name, op_value) in op_obj {
            match op_name.as_str() {
                "$options" => {
                    if !op_obj.contains_key("$regex") {
                        return Err(PipeLiteError::InvalidQuery(
                            "$options requires $regex".to_string(),
                        ));
                    }
                }
                "$regex" => {
                    let pattern = op_value.as_str().ok_or_else(|| {
                        PipeLiteError::InvalidQuery("$regex requires a string pattern".to_string())
                    })?;
                    // Compile eagerly so bad patterns fail at parse time
                    get_or_compile_regex(pattern, regex_options)?;
                    out.push(MatchExpression::Regex {
                        path: path.to_string(),
                        pattern: pattern.to_string(),
                        options: regex_options.to_string(),
                    });
                }
                "$not" => {
                    let inner = Self::parse_not_argument(path, op_value)?;
                    out.push(MatchExpression::Not(Box::new(inner)));
                }
                other => out.push(Self::parse_path_operator(path, other, op_value)?),
            }
        }
        Ok(out)
    }

    /// `$not` takes an operator object (or a bare regex pattern).
    fn parse_not_argument(path: &str, value: &serde_json::Value) -> Result<MatchExpression> {
        let map = value.as_object().ok_or_else(|| {
            PipeLiteError::InvalidQuery("$not requires an operator object".to_string())
        })?;
        if map.is_empty() || map.keys().any(|k| !k.starts_with('$')) {
            return Err(PipeLiteError::InvalidQuery(
                "$not requires an operator object".to_string(),
            ));
        }
        let clauses = Self::parse_field_condition(path, value)?;
        Ok(if clauses.len() == 1 {
            clauses.into_iter().next().unwrap()
        } else {
            MatchExpression::And(clauses)
        })
    }

    fn parse_path_operator(
        path: &str,
        op_name: &str,
        value: &serde_json::Value,
    ) -> Result<MatchExpression> {
        let path = path.to_string();
        match op_name {
            "$eq" | "$gt" | "$gte" | "$lt" | "$lte" => Ok(MatchExpression::Comparison {
                path,
                op: match op_name {
                    "$eq" => ComparisonOp::Eq,
                    "$gt" => ComparisonOp::Gt,
                    "$gte" => ComparisonOp::Gte,
                    "$lt" => ComparisonOp::Lt,
                    _ => ComparisonOp::Lte,
                },
                value: Value::from_json(value),
                collator: None,
                tag: None,
            }),
            "$ne" => Ok(MatchExpression::Not(Box::new(
                MatchExpression::Comparison {
                    path,
                    op: ComparisonOp::Eq,
                    value: Value::from_json(value),
                    collator: None,
                    tag: None,
                },
            ))),
            "$in" | "$nin" => {
                let arr = value.as_array().ok_or_else(|| {
                    PipeLiteError::InvalidQuery(format!("{} requires an array", op_name))
                })?;
                let in_expr = MatchExpression::In {
                    path,
                    values: arr.iter().map(Value::from_json).collect(),
                    collator: None,
                    tag: None,
                };
                Ok(if op_name == "$in" {
                    in_expr
                } else {
                    MatchExpression::Not(Box::new(in_expr))
                })
            }
            "$exists" => {
                let should_exist = value.as_bool().ok_or_else(|| {
                    PipeLiteError::InvalidQuery("$exists requires a boolean".to_string())
                })?;
                let exists = MatchExpression::Exists { path };
                Ok(if should_exist {
                    exists
                } else {
                    MatchExpression::Not(Box::new(exists))
                })
            }
            "$type" => {
                let type_name = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => type_name_from_code(n.as_i64())?.to_string(),
                    _ => {
                        return Err(PipeLiteError::InvalidQuery(
                            "$type requires a string or number".to_string(),
                        ))
                    }
                };
                Ok(MatchExpression::Type { path, type_name })
            }
            "$size" => {
                let size = value.as_i64().ok_or_else(|| {
                    PipeLiteError::InvalidQuery("$size requires an integer".to_string())
                })?;
                Ok(MatchExpression::Size { path, size })
            }
            "$mod" => {
                let arr = value.as_array().ok_or_else(|| {
                    PipeLiteError::InvalidQuery("$mod requires [divisor, remainder]".to_string())
                })?;
                if arr.len() != 2 {
                    return Err(PipeLiteError::InvalidQuery(
                        "$mod requires [divisor, remainder]".to_string(),
                    ));
                }
                let divisor = arr[0].as_i64().ok_or_else(|| {
                    PipeLiteError::InvalidQuery("$mod divisor must be an integer".to_string())
                })?;
                if divisor == 0 {
                    return Err(PipeLiteError::InvalidQuery(
                        "$mod divisor cannot be 0".to_string(),
                    ));
                }
                let remainder = arr[1].as_i64().ok_or_else(|| {
                    PipeLiteError::InvalidQuery("$mod remainder must be an integer".to_string())
                })?;
                Ok(MatchExpression::Mod {
                    path,
                    divisor,
                    remainder,
                })
            }
            "$all" => {
                let arr = value.as_array().ok_or_else(|| {
                    PipeLiteError::InvalidQuery("$all requires an array".to_string())
                })?;
                Ok(MatchExpression::All {
                    path,
                    values: arr.iter().map(Value::from_json).collect(),
                    collator: None,
                })
            }
            "$elemMatch" => {
                let map = value.as_object().ok_or_else(|| {
                    PipeLiteError::InvalidQuery("$elemMatch requires an object".to_string())
                })?;
                // Bare operators apply to the element value itself;
                // logical combinators and field names describe the
                // element as a document
                let value_form = !map.is_empty()
                    && map.keys().all(|k| {
                        k.starts_with('$')
                            && !matches!(k.as_str(), "$and" | "$or" | "$nor" | "$expr")
                    });
                let inner = if value_form {
                    // Operators applied to the element itself
                    let clauses = Self::parse_field_condition("", value)?;
                    if clauses.len() == 1 {
                        clauses.into_iter().next().unwrap()
                    } else {
                        MatchExpression::And(clauses)
                    }
                } else {
                    MatchExpression::parse(value)?
                };
                Ok(MatchExpression::ElemMatch {
                    path,
                    inner: Box::new(inner),
                    value_form,
                })
            }
            other => Err(PipeLiteError::UnknownOperator(other.to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Evaluate the predicate. Never fails: malformed trees cannot be
    /// constructed, and type mismatches simply don't match.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            MatchExpression::And(children) => children.iter().all(|c| c.matches(doc)),
            MatchExpression::Or(children) => children.iter().any(|c| c.matches(doc)),
            MatchExpression::Nor(children) => !children.iter().any(|c| c.matches(doc)),
            MatchExpression::Not(inner) => !inner.matches(doc),
            MatchExpression::AlwaysTrue => true,
            MatchExpression::AlwaysFalse => false,
            MatchExpression::Expr {
                expression,
                collator,
            } => {
                let cmp = ValueComparator::new(collator.clone());
                expression
                    .evaluate(doc, &cmp)
                    .map(|v| v.is_truthy())
                    .unwrap_or(false)
            }
            leaf => {
                let candidates = lookup_path_values(doc, leaf.path());
                candidates.iter().any(|v| leaf.matches_value(v))
            }
        }
    }

    /// Evaluate a leaf (or logical combination of leaves with empty
    /// paths, as inside value-form $elemMatch) against one value.
    pub fn matches_value(&self, v: &Value) -> bool {
        match self {
            MatchExpression::And(children) => children.iter().all(|c| c.matches_value(v)),
            MatchExpression::Or(children) => children.iter().any(|c| c.matches_value(v)),
            MatchExpression::Nor(children) => !children.iter().any(|c| c.matches_value(v)),
            MatchExpression::Not(inner) => !inner.matches_value(v),
            MatchExpression::AlwaysTrue => true,
            MatchExpression::AlwaysFalse => false,
            MatchExpression::Comparison {
                op,
                value,
                collator,
                ..
            } => compare_leaf(*op, value, v, collator.as_deref())
                || matches!(v, Value::Array(arr)
                    if arr.iter().any(|e| compare_leaf(*op, value, e, collator.as_deref()))),
            MatchExpression::In {
                values, collator, ..
            } => {
                let hit = |x: &Value| {
                    values
                        .iter()
                        .any(|t| compare_leaf(ComparisonOp::Eq, t, x, collator.as_deref()))
                };
                hit(v) || matches!(v, Value::Array(arr) if arr.iter().any(|e| hit(e)))
            }
            MatchExpression::Exists { .. } => !v.is_missing(),
            MatchExpression::Type { type_name, .. } => {
                type_matches(v, type_name)
                    || matches!(v, Value::Array(arr)
                        if arr.iter().any(|e| type_matches(e, type_name)))
            }
            MatchExpression::Size { size, .. } => {
                matches!(v, Value::Array(arr) if arr.len() as i64 == *size)
            }
            MatchExpression::Mod {
                divisor, remainder, ..
            } => {
                let check = |x: &Value| match x.as_f64() {
                    Some(n) if n.is_finite() => (n.trunc() as i64) % *divisor == *remainder,
                    _ => false,
                };
                check(v) || matches!(v, Value::Array(arr) if arr.iter().any(check))
            }
            MatchExpression::Regex {
                pattern, options, ..
            } => {
                let check = |x: &Value| match x {
                    Value::String(s) => get_or_compile_regex(pattern, options)
                        .map(|r| r.is_match(s))
                        .unwrap_or(false),
                    _ => false,
                };
                check(v) || matches!(v, Value::Array(arr) if arr.iter().any(check))
            }
            MatchExpression::All {
                values, collator, ..
            } => {
                let elems: &[Value] = match v {
                    Value::Array(arr) => arr,
                    single => std::slice::from_ref(single),
                };
                values.iter().all(|required| {
                    elems.iter().any(|e| {
                        compare_leaf(ComparisonOp::Eq, required, e, collator.as_deref())
                    })
                })
            }
            MatchExpression::ElemMatch {
                inner, value_form, ..
            } => match v {
                Value::Array(arr) => arr.iter().any(|elem| {
                    if *value_form {
                        inner.matches_value(elem)
                    } else {
                        match elem {
                            Value::Object(d) => inner.matches(d),
                            _ => false,
                        }
                    }
                }),
                _ => false,
            },
            MatchExpression::Expr { .. } => false,
        }
    }

    // ------------------------------------------------------------------
    // Optimization
    // ------------------------------------------------------------------

    /// Produce a semantically-equivalent, possibly restructured tree.
    ///
    /// Pure and idempotent: flattens nested same-kind logical nodes,
    /// folds constant branches, unwraps single-child combinators.
    pub fn optimize(self) -> MatchExpression {
        match self {
            MatchExpression::And(children) => {
                let mut flat = Vec::new();
                for child in children {
                    match child.optimize() {
                        MatchExpression::And(inner) => flat.extend(inner),
                        MatchExpression::AlwaysTrue => {}
                        MatchExpression::AlwaysFalse => return MatchExpression::AlwaysFalse,
                        other => flat.push(other),
                    }
                }
                match flat.len() {
                    0 => MatchExpression::AlwaysTrue,
                    1 => flat.pop().unwrap(),
                    _ => MatchExpression::And(flat),
                }
            }
            MatchExpression::Or(children) => {
                let mut flat = Vec::new();
                for child in children {
                    match child.optimize() {
                        MatchExpression::Or(inner) => flat.extend(inner),
                        MatchExpression::AlwaysFalse => {}
                        MatchExpression::AlwaysTrue => return MatchExpression::AlwaysTrue,
                        other => flat.push(other),
                    }
                }
                match flat.len() {
                    0 => MatchExpression::AlwaysFalse,
                    1 => flat.pop().unwrap(),
                    _ => MatchExpression::Or(flat),
                }
            }
            MatchExpression::Nor(children) => {
                let mut flat = Vec::new();
                for child in children {
                    match child.optimize() {
                        MatchExpression::AlwaysFalse => {}
                        MatchExpression::AlwaysTrue => return MatchExpression::AlwaysFalse,
                        other => flat.push(other),
                    }
                }
                if flat.is_empty() {
                    MatchExpression::AlwaysTrue
                } else {
                    MatchExpression::Nor(flat)
                }
            }
            MatchExpression::Not(inner) => match inner.optimize() {
                MatchExpression::AlwaysTrue => MatchExpression::AlwaysFalse,
                MatchExpression::AlwaysFalse => MatchExpression::AlwaysTrue,
                MatchExpression::Not(grand) => *grand,
                other => MatchExpression::Not(Box::new(other)),
            },
            MatchExpression::ElemMatch {
                path,
                inner,
                value_form,
            } => MatchExpression::ElemMatch {
                path,
                inner: Box::new(inner.optimize()),
                value_form,
            },
            leaf => leaf,
        }
    }

    // ------------------------------------------------------------------
    // Collation, serialization, dependencies, splitting
    // ------------------------------------------------------------------

    /// Install a collator recursively. Any memoized per-leaf state
    /// would be invalidated here; leaves recompute on demand instead.
    pub fn set_collator(&mut self, new: Option<Arc<Collator>>) {
        match self {
            MatchExpression::And(c) | MatchExpression::Or(c) | MatchExpression::Nor(c) => {
                for child in c {
                    child.set_collator(new.clone());
                }
            }
            MatchExpression::Not(inner) => inner.set_collator(new),
            MatchExpression::ElemMatch { inner, .. } => inner.set_collator(new),
            MatchExpression::Comparison { collator, .. }
            | MatchExpression::In { collator, .. }
            | MatchExpression::All { collator, .. }
            | MatchExpression::Expr { collator, .. } => *collator = new,
            _ => {}
        }
    }

    /// Serialize to the filter format; `parse(serialize(e))` is
    /// equivalent to `e`.
    pub fn serialize(&self) -> serde_json::Value {
        match self {
            MatchExpression::And(children) => {
                json!({"$and": children.iter().map(|c| c.serialize()).collect::<Vec<_>>()})
            }
            MatchExpression::Or(children) => {
                json!({"$or": children.iter().map(|c| c.serialize()).collect::<Vec<_>>()})
            }
            MatchExpression::Nor(children) => {
                json!({"$nor": children.iter().map(|c| c.serialize()).collect::<Vec<_>>()})
            }
            MatchExpression::Not(inner) => match inner.as_ref() {
                MatchExpression::Comparison {
                    path,
                    op: ComparisonOp::Eq,
                    value,
                    ..
                } => wrap_path(path, json!({ "$ne": value.to_json() })),
                MatchExpression::In { path, values, .. } => wrap_path(
                    path,
                    json!({ "$nin": values.iter().map(Value::to_json).collect::<Vec<_>>() }),
                ),
                MatchExpression::Exists { path } => {
                    wrap_path(path, json!({ "$exists": false }))
                }
                other => {
                    let serialized = other.serialize();
                    let path = other.path().to_string();
                    let ops = strip_path(&serialized, &path);
                    wrap_path(&path, json!({ "$not": ops }))
                }
            },
            MatchExpression::AlwaysTrue => json!({}),
            MatchExpression::AlwaysFalse => json!({"$nor": [{}]}),
            MatchExpression::Comparison {
                path, op, value, ..
            } => {
                let mut ops = serde_json::Map::new();
                ops.insert(op.name().to_string(), value.to_json());
                wrap_path(path, serde_json::Value::Object(ops))
            }
            MatchExpression::In { path, values, .. } => wrap_path(
                path,
                json!({ "$in": values.iter().map(Value::to_json).collect::<Vec<_>>() }),
            ),
            MatchExpression::Exists { path } => wrap_path(path, json!({ "$exists": true })),
            MatchExpression::Type { path, type_name } => {
                wrap_path(path, json!({ "$type": type_name }))
            }
            MatchExpression::Size { path, size } => {
                wrap_path(path, json!({ "$size": size }))
            }
            MatchExpression::Mod {
                path,
                divisor,
                remainder,
            } => wrap_path(path, json!({ "$mod": [divisor, remainder] })),
            MatchExpression::Regex {
                path,
                pattern,
                options,
            } => {
                if options.is_empty() {
                    wrap_path(path, json!({ "$regex": pattern }))
                } else {
                    wrap_path(path, json!({ "$regex": pattern, "$options": options }))
                }
            }
            MatchExpression::All { path, values, .. } => wrap_path(
                path,
                json!({ "$all": values.iter().map(Value::to_json).collect::<Vec<_>>() }),
            ),
            MatchExpression::ElemMatch { path, inner, .. } => {
                let inner_json = inner.serialize();
                let body = if inner.path().is_empty() && inner.num_children() == 0 {
                    strip_path(&inner_json, "")
                } else {
                    match inner.as_ref() {
                        MatchExpression::And(clauses)
                            if clauses.iter().all(|c| c.path().is_empty()) =>
                        {
                            // Value-form conjunction: merge operator objects
                            let mut merged = serde_json::Map::new();
                            for clause in clauses {
                                if let serde_json::Value::Object(m) =
                                    strip_path(&clause.serialize(), "")
                                {
                                    merged.extend(m);
                                }
                            }
                            serde_json::Value::Object(merged)
                        }
                        _ => inner_json,
                    }
                };
                wrap_path(path, json!({ "$elemMatch": body }))
            }
            MatchExpression::Expr { expression, .. } => {
                json!({"$expr": expression.serialize()})
            }
        }
    }

    /// Structure-insensitive equivalence used by tests and the
    /// optimizer's idempotence contract.
    pub fn equivalent(a: &MatchExpression, b: &MatchExpression) -> bool {
        a.serialize() == b.serialize()
    }

    /// Collect the field paths this predicate reads. An empty string
    /// means "the whole document" ($expr with $$ROOT).
    pub fn add_dependencies(&self, deps: &mut BTreeSet<String>) {
        match self {
            MatchExpression::And(c) | MatchExpression::Or(c) | MatchExpression::Nor(c) => {
                for child in c {
                    child.add_dependencies(deps);
                }
            }
            MatchExpression::Not(inner) => inner.add_dependencies(deps),
            MatchExpression::AlwaysTrue | MatchExpression::AlwaysFalse => {}
            MatchExpression::Expr { expression, .. } => expression.add_dependencies(deps),
            MatchExpression::ElemMatch { path, .. } => {
                // The whole array is a dependency; element sub-paths
                // are below it.
                deps.insert(path.clone());
            }
            leaf => {
                deps.insert(leaf.path().to_string());
            }
        }
    }

    /// Split a predicate into (independent, dependent) halves around a
    /// set of modified path prefixes: the independent half reads none
    /// of them and may be evaluated before the modifying stage.
    ///
    /// Only top-level AND decomposes; any other root is all-or-nothing.
    pub fn split_by_paths(
        self,
        banned: &BTreeSet<String>,
    ) -> (Option<MatchExpression>, Option<MatchExpression>) {
        let depends_on_banned = |e: &MatchExpression| {
            let mut deps = BTreeSet::new();
            e.add_dependencies(&mut deps);
            deps.iter().any(|d| {
                d.is_empty()
                    || banned.iter().any(|b| {
                        b.is_empty()
                            || d == b
                            || d.starts_with(&format!("{}.", b))
                            || b.starts_with(&format!("{}.", d))
                    })
            })
        };

        match self {
            MatchExpression::And(children) => {
                let (dependent, independent): (Vec<_>, Vec<_>) =
                    children.into_iter().partition(|c| depends_on_banned(c));
                let rebuild = |mut v: Vec<MatchExpression>| match v.len() {
                    0 => None,
                    1 => Some(v.pop().unwrap()),
                    _ => Some(MatchExpression::And(v)),
                };
                (rebuild(independent), rebuild(dependent))
            }
            other => {
                if depends_on_banned(&other) {
                    (None, Some(other))
                } else {
                    (Some(other), None)
                }
            }
        }
    }
}

/// Extended-JSON typed-value wrappers are operands, not operator
/// objects: `{a: {"$date": 0}}` is an equality match against a date.
fn is_extended_json_wrapper(map: &serde_json::Map<String, serde_json::Value>) -> bool {
    map.len() == 1
        && map.keys().all(|k| {
            matches!(
                k.as_str(),
                "$date" | "$timestamp" | "$oid" | "$minKey" | "$maxKey"
            )
        })
}

/// Build the `{path: ops}` wrapper object.
fn wrap_path(path: &str, ops: serde_json::Value) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(path.to_string(), ops);
    serde_json::Value::Object(map)
}

/// Remove the path wrapper from `{path: {...ops}}`, yielding the
/// operator object.
fn strip_path(serialized: &serde_json::Value, path: &str) -> serde_json::Value {
    serialized
        .as_object()
        .and_then(|m| m.get(path))
        .cloned()
        .unwrap_or_else(|| serialized.clone())
}

/// Collect candidate values for a path, descending through arrays of
/// objects the way the query language does: `{a: [{b: 1}]}` yields 1
/// for path "a.b".
pub fn lookup_path_values(doc: &Document, path: &str) -> Vec<Value> {
    if path.is_empty() {
        return vec![Value::object(doc.clone())];
    }
    let mut current = vec![Value::object(doc.clone())];
    for part in path.split('.') {
        let mut next = Vec::new();
        for v in &current {
            match v {
                Value::Object(d) => {
                    let fv = d.get_value(part);
                    if !fv.is_missing() {
                        next.push(fv);
                    }
                }
                Value::Array(arr) => {
                    if let Ok(index) = part.parse::<usize>() {
                        if let Some(elem) = arr.get(index) {
                            next.push(elem.clone());
                        }
                    }
                    for elem in arr.iter() {
                        if let Value::Object(d) = elem {
                            let fv = d.get_value(part);
                            if !fv.is_missing() {
                                next.push(fv);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        if next.is_empty() {
            return vec![Value::Missing];
        }
        current = next;
    }
    current
}

/// Leaf comparison semantics: same canonical bracket only, null
/// operand matches nullish values, NaN only matches through equality.
fn compare_leaf(op: ComparisonOp, target: &Value, v: &Value, collator: Option<&Collator>) -> bool {
    // Null target: only equality-shaped matches against null/missing
    if target.is_null() {
        return match op {
            ComparisonOp::Eq | ComparisonOp::Gte | ComparisonOp::Lte => v.is_nullish(),
            ComparisonOp::Gt | ComparisonOp::Lt => false,
        };
    }
    if target.is_nan() {
        return match op {
            ComparisonOp::Eq | ComparisonOp::Gte | ComparisonOp::Lte => v.is_nan(),
            ComparisonOp::Gt | ComparisonOp::Lt => false,
        };
    }
    if v.is_nan() {
        return false;
    }
    // Query comparisons never match across type brackets
    if v.canonical_order() != target.canonical_order() {
        return false;
    }
    let ord = Value::compare(v, target, collator);
    match op {
        ComparisonOp::Eq => ord == Ordering::Equal,
        ComparisonOp::Gt => ord == Ordering::Greater,
        ComparisonOp::Gte => ord != Ordering::Less,
        ComparisonOp::Lt => ord == Ordering::Less,
        ComparisonOp::Lte => ord != Ordering::Greater,
    }
}

fn type_matches(v: &Value, type_name: &str) -> bool {
    match type_name {
        "number" => v.is_numeric(),
        "double" => matches!(v, Value::Double(_)),
        "int" => matches!(v, Value::Int32(_)),
        "long" => matches!(v, Value::Int64(_)),
        "string" => matches!(v, Value::String(_)),
        "object" => matches!(v, Value::Object(_)),
        "array" => matches!(v, Value::Array(_)),
        "bool" | "boolean" => matches!(v, Value::Bool(_)),
        "null" => v.is_null(),
        "date" => matches!(v, Value::Date(_)),
        "timestamp" => matches!(v, Value::Timestamp(_)),
        "objectId" => matches!(v, Value::ObjectId(_)),
        "regex" => matches!(v, Value::Regex { .. }),
        "minKey" => matches!(v, Value::MinKey),
        "maxKey" => matches!(v, Value::MaxKey),
        _ => false,
    }
}

fn type_name_from_code(code: Option<i64>) -> Result<&'static str> {
    match code {
        Some(1) => Ok("double"),
        Some(2) => Ok("string"),
        Some(3) => Ok("object"),
        Some(4) => Ok("array"),
        Some(7) => Ok("objectId"),
        Some(8) => Ok("bool"),
        Some(9) => Ok("date"),
        Some(10) => Ok("null"),
        Some(11) => Ok("regex"),
        Some(16) => Ok("int"),
        Some(17) => Ok("timestamp"),
        Some(18) => Ok("long"),
        Some(-1) => Ok("minKey"),
        Some(127) => Ok("maxKey"),
        other => Err(PipeLiteError::InvalidQuery(format!(
            "unknown type code: {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(json: serde_json::Value) -> Document {
        Document::from_json(&json)
    }

    fn parse(filter: serde_json::Value) -> MatchExpression {
        MatchExpression::parse(&filter).unwrap()
    }

    #[test]
    fn test_direct_equality() {
        let m = parse(json!({"name": "Alice"}));
        assert!(m.matches(&doc(json!({"name": "Alice"}))));
        assert!(!m.matches(&doc(json!({"name": "Bob"}))));
    }

    #[test]
    fn test_comparison_range() {
        let m = parse(json!({"age": {"$gte": 18, "$lt": 30}}));
        assert!(m.matches(&doc(json!({"age": 25}))));
        assert!(!m.matches(&doc(json!({"age": 15}))));
        assert!(!m.matches(&doc(json!({"age": 35}))));
    }

    #[test]
    fn test_comparisons_do_not_cross_type_brackets() {
        let m = parse(json!({"a": {"$gt": 5}}));
        assert!(!m.matches(&doc(json!({"a": "10"}))));
        assert!(!m.matches(&doc(json!({"a": true}))));
    }

    #[test]
    fn test_eq_null_matches_missing() {
        let m = parse(json!({"a": null}));
        assert!(m.matches(&doc(json!({"a": null}))));
        assert!(m.matches(&doc(json!({"b": 1}))));
        assert!(!m.matches(&doc(json!({"a": 0}))));
    }

    #[test]
    fn test_exists_distinguishes_null_from_missing() {
        let exists = parse(json!({"a": {"$exists": true}}));
        assert!(exists.matches(&doc(json!({"a": null}))));
        assert!(!exists.matches(&doc(json!({"b": 1}))));

        let not_exists = parse(json!({"a": {"$exists": false}}));
        assert!(!not_exists.matches(&doc(json!({"a": null}))));
        assert!(not_exists.matches(&doc(json!({"b": 1}))));
    }

    #[test]
    fn test_ne_matches_missing() {
        let m = parse(json!({"a": {"$ne": 5}}));
        assert!(m.matches(&doc(json!({}))));
        assert!(m.matches(&doc(json!({"a": 6}))));
        assert!(!m.matches(&doc(json!({"a": 5}))));
        assert!(!m.matches(&doc(json!({"a": [1, 5]}))));
    }

    #[test]
    fn test_in_nin() {
        let m = parse(json!({"city": {"$in": ["NYC", "LA"]}}));
        assert!(m.matches(&doc(json!({"city": "NYC"}))));
        assert!(!m.matches(&doc(json!({"city": "Chicago"}))));
        assert!(m.matches(&doc(json!({"city": ["Chicago", "LA"]}))));

        let n = parse(json!({"city": {"$nin": ["NYC", "LA"]}}));
        assert!(n.matches(&doc(json!({"city": "Chicago"}))));
        assert!(n.matches(&doc(json!({}))));
        assert!(!n.matches(&doc(json!({"city": "NYC"}))));
    }

    #[test]
    fn test_array_element_matching() {
        let m = parse(json!({"scores": {"$gt": 90}}));
        assert!(m.matches(&doc(json!({"scores": [85, 95]}))));
        assert!(!m.matches(&doc(json!({"scores": [85, 88]}))));
    }

    #[test]
    fn test_path_through_array_of_objects() {
        let m = parse(json!({"items.qty": 5}));
        assert!(m.matches(&doc(json!({"items": [{"qty": 2}, {"qty": 5}]}))));
        assert!(!m.matches(&doc(json!({"items": [{"qty": 2}]}))));
    }

    #[test]
    fn test_logical_operators() {
        let m = parse(json!({"$or": [{"age": {"$lt": 18}}, {"age": {"$gt": 65}}]}));
        assert!(m.matches(&doc(json!({"age": 15}))));
        assert!(m.matches(&doc(json!({"age": 70}))));
        assert!(!m.matches(&doc(json!({"age": 30}))));

        let n = parse(json!({"$nor": [{"a": 1}, {"b": 1}]}));
        assert!(n.matches(&doc(json!({"a": 2}))));
        assert!(!n.matches(&doc(json!({"a": 1}))));
    }

    #[test]
    fn test_not_operator() {
        let m = parse(json!({"a": {"$not": {"$gt": 5}}}));
        assert!(m.matches(&doc(json!({"a": 3}))));
        assert!(m.matches(&doc(json!({}))));
        assert!(!m.matches(&doc(json!({"a": 10}))));
    }

    #[test]
    fn test_size_and_all() {
        let s = parse(json!({"tags": {"$size": 2}}));
        assert!(s.matches(&doc(json!({"tags": ["a", "b"]}))));
        assert!(!s.matches(&doc(json!({"tags": ["a"]}))));

        let a = parse(json!({"tags": {"$all": ["a", "b"]}}));
        assert!(a.matches(&doc(json!({"tags": ["b", "c", "a"]}))));
        assert!(!a.matches(&doc(json!({"tags": ["a", "c"]}))));
    }

    #[test]
    fn test_elem_match_object_form() {
        let m = parse(json!({"results": {"$elemMatch": {"product": "xyz", "score": {"$gte": 8}}}}));
        assert!(m.matches(&doc(json!({
            "results": [{"product": "abc", "score": 10}, {"product": "xyz", "score": 9}]
        }))));
        // No single element satisfies both conditions
        assert!(!m.matches(&doc(json!({
            "results": [{"product": "abc", "score": 10}, {"product": "xyz", "score": 5}]
        }))));
    }

    #[test]
    fn test_elem_match_value_form() {
        let m = parse(json!({"scores": {"$elemMatch": {"$gte": 80, "$lt": 85}}}));
        assert!(m.matches(&doc(json!({"scores": [90, 82]}))));
        assert!(!m.matches(&doc(json!({"scores": [90, 79]}))));
    }

    #[test]
    fn test_mod_operator() {
        let m = parse(json!({"qty": {"$mod": [4, 0]}}));
        assert!(m.matches(&doc(json!({"qty": 8}))));
        assert!(!m.matches(&doc(json!({"qty": 7}))));
        assert!(MatchExpression::parse(&json!({"qty": {"$mod": [0, 0]}})).is_err());
    }

    #[test]
    fn test_regex_with_options() {
        let m = parse(json!({"name": {"$regex": "^al", "$options": "i"}}));
        assert!(m.matches(&doc(json!({"name": "Alice"}))));
        assert!(!m.matches(&doc(json!({"name": "Bob"}))));
        assert!(MatchExpression::parse(&json!({"name": {"$regex": "("}})).is_err());
    }

    #[test]
    fn test_type_operator() {
        let m = parse(json!({"a": {"$type": "string"}}));
        assert!(m.matches(&doc(json!({"a": "x"}))));
        assert!(!m.matches(&doc(json!({"a": 1}))));

        let by_code = parse(json!({"a": {"$type": 2}}));
        assert!(by_code.matches(&doc(json!({"a": "x"}))));
    }

    #[test]
    fn test_nan_equality_only() {
        let eq = MatchExpression::Comparison {
            path: "a".into(),
            op: ComparisonOp::Eq,
            value: Value::Double(f64::NAN),
            collator: None,
            tag: None,
        };
        assert!(eq.matches_value(&Value::Double(f64::NAN)));
        assert!(!eq.matches_value(&Value::Int64(1)));

        let gt = MatchExpression::Comparison {
            path: "a".into(),
            op: ComparisonOp::Gt,
            value: Value::Double(f64::NAN),
            collator: None,
            tag: None,
        };
        assert!(!gt.matches_value(&Value::Double(f64::NAN)));
        assert!(!gt.matches_value(&Value::Int64(1)));
    }

    #[test]
    fn test_extended_json_wrapper_is_equality_operand() {
        let m = parse(json!({"when": {"$date": 1000}}));
        assert!(m.matches(&doc(json!({"when": {"$date": 1000}}))));
        assert!(!m.matches(&doc(json!({"when": {"$date": 2000}}))));

        let range = parse(json!({"when": {"$gt": {"$date": 1000}}}));
        assert!(range.matches(&doc(json!({"when": {"$date": 2000}}))));
        assert!(!range.matches(&doc(json!({"when": 5000}))));
    }

    #[test]
    fn test_unknown_operator_is_parse_error() {
        let err = MatchExpression::parse(&json!({"a": {"$frob": 1}})).unwrap_err();
        assert!(matches!(err, PipeLiteError::UnknownOperator(_)));
    }

    #[test]
    fn test_expr_operator() {
        let m = parse(json!({"$expr": {"$gt": ["$spent", "$budget"]}}));
        assert!(m.matches(&doc(json!({"spent": 120, "budget": 100}))));
        assert!(!m.matches(&doc(json!({"spent": 80, "budget": 100}))));
    }

    #[test]
    fn test_collator_propagation() {
        let mut m = parse(json!({"name": "alice"}));
        assert!(!m.matches(&doc(json!({"name": "ALICE"}))));
        m.set_collator(Some(Arc::new(Collator::case_insensitive())));
        assert!(m.matches(&doc(json!({"name": "ALICE"}))));
    }

    #[test]
    fn test_optimize_flattens_and_folds() {
        let m = parse(json!({"$and": [
            {"$and": [{"a": 1}, {"b": 2}]},
            {"c": 3}
        ]}));
        let optimized = m.optimize();
        assert_eq!(optimized.match_type(), MatchType::And);
        assert_eq!(optimized.num_children(), 3);

        let folded =
            MatchExpression::And(vec![MatchExpression::AlwaysFalse, parse(json!({"a": 1}))])
                .optimize();
        assert_eq!(folded.match_type(), MatchType::AlwaysFalse);
    }

    #[test]
    fn test_optimize_idempotent() {
        let filters = vec![
            json!({"$and": [{"$and": [{"a": 1}]}, {"$or": [{"b": 2}, {"c": 3}]}]}),
            json!({"a": {"$gt": 1, "$lt": 5}, "b": {"$ne": null}}),
            json!({"$nor": [{"a": {"$exists": false}}]}),
        ];
        for filter in filters {
            let once = parse(filter).optimize();
            let twice = once.clone().optimize();
            assert!(
                MatchExpression::equivalent(&once, &twice),
                "not idempotent: {} vs {}",
                once.serialize(),
                twice.serialize()
            );
        }
    }

    #[test]
    fn test_serialize_roundtrip() {
        let filters = vec![
            json!({"a": {"$gt": 1}}),
            json!({"a": {"$ne": 5}, "b": {"$in": [1, 2]}}),
            json!({"$or": [{"a": 1}, {"b": {"$exists": false}}]}),
            json!({"tags": {"$all": ["x"]}, "n": {"$mod": [3, 1]}}),
            json!({"results": {"$elemMatch": {"score": {"$gte": 8}}}}),
            json!({"scores": {"$elemMatch": {"$gte": 80, "$lt": 85}}}),
        ];
        let docs = vec![
            doc(json!({"a": 2, "b": 1, "tags": ["x"], "n": 4,
                       "results": [{"score": 9}], "scores": [83]})),
            doc(json!({"a": 5, "b": 3, "tags": [], "n": 5,
                       "results": [{"score": 2}], "scores": [90]})),
            doc(json!({})),
        ];
        for filter in filters {
            let original = parse(filter);
            let reparsed = MatchExpression::parse(&original.serialize()).unwrap();
            for d in &docs {
                assert_eq!(
                    original.matches(d),
                    reparsed.matches(d),
                    "round-trip changed semantics for {}",
                    original.serialize()
                );
            }
        }
    }

    #[test]
    fn test_dependencies() {
        let m = parse(json!({"a.b": 1, "$or": [{"c": 2}, {"d.e": {"$gt": 3}}]}));
        let mut deps = BTreeSet::new();
        m.add_dependencies(&mut deps);
        assert!(deps.contains("a.b"));
        assert!(deps.contains("c"));
        assert!(deps.contains("d.e"));
    }

    #[test]
    fn test_split_by_paths() {
        let m = parse(json!({"a": 1, "b": 2}));
        let banned: BTreeSet<String> = ["b".to_string()].into_iter().collect();
        let (independent, dependent) = m.split_by_paths(&banned);
        assert_eq!(independent.unwrap().serialize(), json!({"a": {"$eq": 1}}));
        assert_eq!(dependent.unwrap().serialize(), json!({"b": {"$eq": 2}}));
    }

    #[test]
    fn test_split_respects_path_prefixes() {
        let m = parse(json!({"a.x": 1, "c": 2}));
        let banned: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        let (independent, dependent) = m.split_by_paths(&banned);
        assert_eq!(independent.unwrap().serialize(), json!({"c": {"$eq": 2}}));
        assert!(dependent.is_some());
    }
}
