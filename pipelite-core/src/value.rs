// pipelite-core/src/value.rs
// Immutable, type-tagged value model with canonical cross-type ordering

use crate::collation::Collator;
use crate::document::Document;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// An immutable tagged value.
///
/// Arrays and objects share their payload via reference counting, so
/// cloning a `Value` is always cheap. `Missing` is distinct from
/// `Null`: a field that is absent from a document reads as `Missing`,
/// and the two are distinguished per operator ($exists vs $eq null).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Missing,
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Array(Arc<Vec<Value>>),
    Object(Arc<Document>),
    /// Milliseconds since the Unix epoch (UTC)
    Date(i64),
    /// Internal ordering token: (seconds << 32) | increment
    Timestamp(u64),
    ObjectId(String),
    Regex { pattern: String, options: String },
    MinKey,
    MaxKey,
}

impl Value {
    pub fn array(values: Vec<Value>) -> Value {
        Value::Array(Arc::new(values))
    }

    pub fn object(doc: Document) -> Value {
        Value::Object(Arc::new(doc))
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    /// Fresh ObjectId backed by a UUID v4, the same scheme the
    /// document-id generator uses.
    pub fn new_object_id() -> Value {
        Value::ObjectId(uuid::Uuid::new_v4().to_string())
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Missing and Null both read as "nullish" for operators that
    /// treat an absent field like null ($eq null, $ifNull).
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Missing | Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int32(_) | Value::Int64(_) | Value::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Double(d) if d.is_nan())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(i) => Some(*i as i64),
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(i) => Some(*i as f64),
            Value::Int64(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Document> {
        match self {
            Value::Object(d) => Some(d),
            _ => None,
        }
    }

    /// Truthiness for $redact-style conditionals: false, 0, null and
    /// missing are falsy, everything else truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Missing | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int32(i) => *i != 0,
            Value::Int64(i) => *i != 0,
            Value::Double(d) => *d != 0.0,
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing => "missing",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int32(_) => "int",
            Value::Int64(_) => "long",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
            Value::ObjectId(_) => "objectId",
            Value::Regex { .. } => "regex",
            Value::MinKey => "minKey",
            Value::MaxKey => "maxKey",
        }
    }

    /// Canonical type bracket used as the first comparison key.
    ///
    /// All numeric subtypes share one bracket so cross-subtype
    /// comparison happens by mathematical value.
    pub fn canonical_order(&self) -> u8 {
        match self {
            Value::MinKey => 0,
            Value::Missing => 1,
            Value::Null => 2,
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) => 3,
            Value::String(_) => 4,
            Value::Object(_) => 5,
            Value::Array(_) => 6,
            Value::ObjectId(_) => 7,
            Value::Bool(_) => 8,
            Value::Date(_) => 9,
            Value::Timestamp(_) => 10,
            Value::Regex { .. } => 11,
            Value::MaxKey => 12,
        }
    }

    /// Total order over all values.
    ///
    /// NaN sorts below every other number so the relation stays total;
    /// NaN compares Equal to NaN here, which keeps hashing consistent.
    /// Operators that need IEEE semantics special-case NaN themselves.
    pub fn compare(a: &Value, b: &Value, collator: Option<&Collator>) -> Ordering {
        let bracket = a.canonical_order().cmp(&b.canonical_order());
        if bracket != Ordering::Equal {
            return bracket;
        }

        match (a, b) {
            (Value::MinKey, Value::MinKey)
            | (Value::Missing, Value::Missing)
            | (Value::Null, Value::Null)
            | (Value::MaxKey, Value::MaxKey) => Ordering::Equal,

            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Date(x), Value::Date(y)) => x.cmp(y),
            (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
            (Value::ObjectId(x), Value::ObjectId(y)) => x.cmp(y),

            (
                Value::Regex {
                    pattern: pa,
                    options: oa,
                },
                Value::Regex {
                    pattern: pb,
                    options: ob,
                },
            ) => pa.cmp(pb).then_with(|| oa.cmp(ob)),

            (Value::String(x), Value::String(y)) => match collator {
                Some(c) => c.compare(x, y),
                None => x.cmp(y),
            },

            (Value::Array(x), Value::Array(y)) => {
                for (ea, eb) in x.iter().zip(y.iter()) {
                    let cmp = Value::compare(ea, eb, collator);
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                }
                x.len().cmp(&y.len())
            }

            (Value::Object(x), Value::Object(y)) => Document::compare(x, y, collator),

            // Same bracket left: numerics
            _ => compare_numbers(a, b),
        }
    }

    /// Collator-aware hashing.
    ///
    /// Invariant: `compare(a, b, c) == Equal` implies identical hashes
    /// under the same collator. Numbers hash through a canonical
    /// i64-or-f64 form, strings through their collation key.
    pub fn hash_with<H: Hasher>(&self, state: &mut H, collator: Option<&Collator>) {
        match self {
            Value::Missing => state.write_u8(1),
            Value::MinKey => state.write_u8(0),
            Value::Null => state.write_u8(2),
            Value::MaxKey => state.write_u8(12),
            Value::Bool(b) => {
                state.write_u8(8);
                b.hash(state);
            }
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) => {
                state.write_u8(3);
                hash_number(self, state);
            }
            Value::String(s) => {
                state.write_u8(4);
                match collator {
                    Some(c) => c.collation_key(s).hash(state),
                    None => s.hash(state),
                }
            }
            Value::Array(arr) => {
                state.write_u8(6);
                state.write_usize(arr.len());
                for v in arr.iter() {
                    v.hash_with(state, collator);
                }
            }
            Value::Object(doc) => {
                state.write_u8(5);
                doc.hash_with(state, collator);
            }
            Value::Date(d) => {
                state.write_u8(9);
                d.hash(state);
            }
            Value::Timestamp(t) => {
                state.write_u8(10);
                t.hash(state);
            }
            Value::ObjectId(oid) => {
                state.write_u8(7);
                oid.hash(state);
            }
            Value::Regex { pattern, options } => {
                state.write_u8(11);
                pattern.hash(state);
                options.hash(state);
            }
        }
    }

    /// Stable byte estimate used by every memory-budget check.
    ///
    /// Equal values always report equal sizes, so bookkeeping
    /// add/subtract pairs cancel exactly.
    pub fn approximate_size(&self) -> usize {
        let base = std::mem::size_of::<Value>();
        match self {
            Value::String(s) => base + s.len(),
            Value::ObjectId(s) => base + s.len(),
            Value::Regex { pattern, options } => base + pattern.len() + options.len(),
            Value::Array(arr) => {
                base + arr.iter().map(Value::approximate_size).sum::<usize>()
            }
            Value::Object(doc) => base + doc.approximate_size(),
            _ => base,
        }
    }

    /// Build a value from parsed JSON. Integral JSON numbers become
    /// Int64, everything else Double. Single-key extended-JSON
    /// wrappers ($date, $timestamp, $oid, $minKey, $maxKey) map back
    /// to their typed values, so `to_json` round-trips.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int64(i)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(arr) => {
                Value::array(arr.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(wrapped) = Self::from_extended_json(map) {
                        return wrapped;
                    }
                }
                Value::object(Document::from_json(json))
            }
        }
    }

    fn from_extended_json(map: &serde_json::Map<String, serde_json::Value>) -> Option<Value> {
        let (key, inner) = map.iter().next()?;
        match key.as_str() {
            "$date" => match inner {
                serde_json::Value::Number(n) => n.as_i64().map(Value::Date),
                // RFC 3339 date strings parse through chrono
                serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| Value::Date(dt.timestamp_millis())),
                _ => None,
            },
            "$timestamp" => inner.as_u64().map(Value::Timestamp),
            "$oid" => inner.as_str().map(|s| Value::ObjectId(s.to_string())),
            "$minKey" => Some(Value::MinKey),
            "$maxKey" => Some(Value::MaxKey),
            _ => None,
        }
    }

    /// The date payload as a chrono UTC datetime.
    pub fn as_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match self {
            Value::Date(millis) => chrono::DateTime::from_timestamp_millis(*millis),
            _ => None,
        }
    }

    /// Convert back to JSON. Missing maps to Null (JSON has no absent
    /// scalar); non-JSON types use a single-key wrapper so the output
    /// re-parses losslessly enough for serialization round-trips.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Missing | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int32(i) => serde_json::json!(i),
            Value::Int64(i) => serde_json::json!(i),
            Value::Double(d) => {
                serde_json::Number::from_f64(*d).map_or(serde_json::json!("NaN"), |n| {
                    serde_json::Value::Number(n)
                })
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(Value::to_json).collect())
            }
            Value::Object(doc) => doc.to_json(),
            Value::Date(millis) => serde_json::json!({ "$date": millis }),
            Value::Timestamp(t) => serde_json::json!({ "$timestamp": t }),
            Value::ObjectId(oid) => serde_json::json!({ "$oid": oid }),
            Value::Regex { pattern, options } => {
                serde_json::json!({ "$regex": pattern, "$options": options })
            }
            Value::MinKey => serde_json::json!({ "$minKey": 1 }),
            Value::MaxKey => serde_json::json!({ "$maxKey": 1 }),
        }
    }
}

/// Exact comparison between numeric values, no precision-loss
/// inversion near the i64 range boundary.
fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Double(x), Value::Double(y)) => compare_doubles(*x, *y),
        (Value::Double(x), _) => compare_double_to_int(*x, b.as_i64().unwrap_or(0)),
        (_, Value::Double(y)) => compare_double_to_int(*y, a.as_i64().unwrap_or(0)).reverse(),
        _ => a.as_i64().unwrap_or(0).cmp(&b.as_i64().unwrap_or(0)),
    }
}

/// NaN sorts below all other doubles and equals itself.
fn compare_doubles(x: f64, y: f64) -> Ordering {
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

/// Orders `i` relative to `d`, returned as d-vs-i.
///
/// Doubles at or beyond the i64 range order by sign; inside the range
/// the integer parts compare exactly and the fraction breaks ties.
fn compare_double_to_int(d: f64, i: i64) -> Ordering {
    if d.is_nan() {
        return Ordering::Less;
    }
    // 2^63 is exactly representable; i64::MAX is not.
    if d >= 9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    if d < -9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    let trunc = d.trunc() as i64;
    match trunc.cmp(&i) {
        Ordering::Equal => {
            let frac = d - d.trunc();
            if frac > 0.0 {
                Ordering::Greater
            } else if frac < 0.0 {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

/// Hash a numeric value through its canonical form: integral values in
/// i64 range hash as i64 (so 2, 2i64 and 2.0 collide), everything else
/// by f64 bits with -0.0 folded to 0.0 and a fixed NaN image.
fn hash_number<H: Hasher>(v: &Value, state: &mut H) {
    match v {
        Value::Int32(i) => (*i as i64).hash(state),
        Value::Int64(i) => i.hash(state),
        Value::Double(d) => {
            if d.is_nan() {
                state.write_u64(0x7ff8_0000_0000_0000);
            } else if d.fract() == 0.0
                && *d >= -9_223_372_036_854_775_808.0
                && *d < 9_223_372_036_854_775_808.0
            {
                (*d as i64).hash(state);
            } else {
                d.to_bits().hash(state);
            }
        }
        _ => unreachable!("hash_number called on non-numeric value"),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Value::compare(self, other, None) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_with(state, None)
    }
}

/// Comparator binding a collator to value comparison, hashing and map
/// canonicalization, so hashing-heavy consumers ($group, $addToSet,
/// the lookup cache) stay consistent with `compare`.
#[derive(Debug, Clone, Default)]
pub struct ValueComparator {
    collator: Option<Arc<Collator>>,
}

impl ValueComparator {
    pub fn new(collator: Option<Arc<Collator>>) -> Self {
        ValueComparator { collator }
    }

    pub fn collator(&self) -> Option<&Collator> {
        self.collator.as_deref()
    }

    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        Value::compare(a, b, self.collator())
    }

    pub fn eq(&self, a: &Value, b: &Value) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    /// Canonical form for use as a plain-Eq/plain-Hash map key: strings
    /// are replaced by their collation keys, recursively. Under a
    /// binary collator the value is returned unchanged.
    pub fn canonicalize(&self, v: &Value) -> Value {
        let Some(collator) = self.collator() else {
            return v.clone();
        };
        canonicalize_value(v, collator)
    }
}

fn canonicalize_value(v: &Value, collator: &Collator) -> Value {
    match v {
        Value::String(s) => Value::String(collator.collation_key(s).into_owned()),
        Value::Array(arr) => {
            Value::array(arr.iter().map(|e| canonicalize_value(e, collator)).collect())
        }
        Value::Object(doc) => Value::object(doc.canonicalize(collator)),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value, collator: Option<&Collator>) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash_with(&mut h, collator);
        h.finish()
    }

    #[test]
    fn test_type_bracket_ordering() {
        let ordered = vec![
            Value::MinKey,
            Value::Missing,
            Value::Null,
            Value::Int64(5),
            Value::string("abc"),
            Value::object(Document::new()),
            Value::array(vec![]),
            Value::ObjectId("0".into()),
            Value::Bool(false),
            Value::Date(0),
            Value::Timestamp(0),
            Value::Regex {
                pattern: "a".into(),
                options: String::new(),
            },
            Value::MaxKey,
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                Value::compare(&pair[0], &pair[1], None),
                Ordering::Less,
                "{:?} should sort before {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_cross_subtype_numeric_compare() {
        assert_eq!(
            Value::compare(&Value::Int32(2), &Value::Double(2.0), None),
            Ordering::Equal
        );
        assert_eq!(
            Value::compare(&Value::Int64(2), &Value::Double(2.5), None),
            Ordering::Less
        );
        assert_eq!(
            Value::compare(&Value::Double(-0.5), &Value::Int32(0), None),
            Ordering::Less
        );
    }

    #[test]
    fn test_large_int_vs_double_no_inversion() {
        // 2^63 as a double is out of i64 range and must sort above
        // every i64.
        let max = Value::Int64(i64::MAX);
        let two_63 = Value::Double(9_223_372_036_854_775_808.0);
        assert_eq!(Value::compare(&max, &two_63, None), Ordering::Less);

        // i64::MAX - 1 is not representable as f64; the nearest double
        // rounds to 2^63 and must still sort above it.
        let near = Value::Double((i64::MAX - 1) as f64);
        assert_eq!(Value::compare(&max, &near, None), Ordering::Less);

        let min = Value::Int64(i64::MIN);
        let neg_two_63 = Value::Double(-9_223_372_036_854_775_808.0);
        assert_eq!(Value::compare(&min, &neg_two_63, None), Ordering::Equal);
    }

    #[test]
    fn test_nan_total_order() {
        let nan = Value::Double(f64::NAN);
        assert_eq!(Value::compare(&nan, &nan, None), Ordering::Equal);
        assert_eq!(
            Value::compare(&nan, &Value::Double(f64::NEG_INFINITY), None),
            Ordering::Less
        );
        assert_eq!(
            Value::compare(&nan, &Value::Int64(i64::MIN), None),
            Ordering::Less
        );
        // NaN still sorts above Null (different bracket)
        assert_eq!(Value::compare(&nan, &Value::Null, None), Ordering::Greater);
    }

    #[test]
    fn test_array_lexicographic() {
        let a = Value::array(vec![Value::Int64(1), Value::Int64(2)]);
        let b = Value::array(vec![Value::Int64(1), Value::Int64(3)]);
        let c = Value::array(vec![Value::Int64(1)]);
        assert_eq!(Value::compare(&a, &b, None), Ordering::Less);
        assert_eq!(Value::compare(&c, &a, None), Ordering::Less);
        assert_eq!(Value::compare(&a, &a, None), Ordering::Equal);
    }

    #[test]
    fn test_string_collation() {
        let ci = Collator::case_insensitive();
        let a = Value::string("Apple");
        let b = Value::string("apple");
        assert_eq!(Value::compare(&a, &b, Some(&ci)), Ordering::Equal);
        assert_eq!(Value::compare(&a, &b, None), Ordering::Less);
    }

    #[test]
    fn test_hash_consistency_numbers() {
        assert_eq!(
            hash_of(&Value::Int32(2), None),
            hash_of(&Value::Double(2.0), None)
        );
        assert_eq!(
            hash_of(&Value::Int64(2), None),
            hash_of(&Value::Int32(2), None)
        );
        assert_eq!(
            hash_of(&Value::Double(0.0), None),
            hash_of(&Value::Double(-0.0), None)
        );
        assert_eq!(
            hash_of(&Value::Double(f64::NAN), None),
            hash_of(&Value::Double(f64::NAN), None)
        );
    }

    #[test]
    fn test_hash_consistency_collated_strings() {
        let ci = Collator::case_insensitive();
        assert_eq!(
            hash_of(&Value::string("ABC"), Some(&ci)),
            hash_of(&Value::string("abc"), Some(&ci))
        );
        assert_ne!(
            hash_of(&Value::string("ABC"), None),
            hash_of(&Value::string("abc"), None)
        );
    }

    #[test]
    fn test_approximate_size_equal_inputs() {
        let a = Value::array(vec![Value::string("hello"), Value::Int64(1)]);
        let b = Value::array(vec![Value::string("hello"), Value::Int64(1)]);
        assert_eq!(a.approximate_size(), b.approximate_size());
        assert!(a.approximate_size() > Value::Null.approximate_size());
    }

    #[test]
    fn test_from_json_number_tagging() {
        assert_eq!(Value::from_json(&serde_json::json!(5)), Value::Int64(5));
        assert_eq!(
            Value::from_json(&serde_json::json!(5.5)),
            Value::Double(5.5)
        );
        assert_eq!(Value::from_json(&serde_json::json!(null)), Value::Null);
    }

    #[test]
    fn test_extended_json_dates() {
        let by_millis = Value::from_json(&serde_json::json!({"$date": 1000}));
        assert_eq!(by_millis, Value::Date(1000));

        let by_string =
            Value::from_json(&serde_json::json!({"$date": "1970-01-01T00:00:01Z"}));
        assert_eq!(by_string, Value::Date(1000));
        assert_eq!(
            by_string.as_datetime().unwrap().timestamp_millis(),
            1000
        );

        // to_json round-trips through the wrapper form
        assert_eq!(Value::from_json(&by_millis.to_json()), by_millis);
    }

    #[test]
    fn test_extended_json_non_wrappers_stay_objects() {
        let v = Value::from_json(&serde_json::json!({"$date": true}));
        assert!(matches!(v, Value::Object(_)));
        let v = Value::from_json(&serde_json::json!({"a": 1}));
        assert!(matches!(v, Value::Object(_)));
    }

    #[test]
    fn test_canonicalize_for_map_keys() {
        let cmp = ValueComparator::new(Some(Arc::new(Collator::case_insensitive())));
        let a = cmp.canonicalize(&Value::string("ABC"));
        let b = cmp.canonicalize(&Value::string("abc"));
        assert_eq!(a, b);

        let nested = cmp.canonicalize(&Value::array(vec![Value::string("X")]));
        assert_eq!(nested, Value::array(vec![Value::string("x")]));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Missing.is_truthy());
        assert!(!Value::Int64(0).is_truthy());
        assert!(!Value::Double(0.0).is_truthy());
        assert!(Value::string("").is_truthy());
        assert!(Value::Bool(true).is_truthy());
    }
}
