// pipelite-core/src/accumulator.rs
// Stateful reducers for $group and friends

use crate::document::DocumentBuilder;
use crate::error::{PipeLiteError, Result};
use crate::expression::Expression;
use crate::value::{Value, ValueComparator};
use ahash::AHashSet;
use lazy_static::lazy_static;
use std::collections::HashMap;

/// A stateful reducer.
///
/// `process(v, merging=false)` folds one input value; with
/// `merging=true` the input is a partial result produced by another
/// worker's `value(to_be_merged=true)` and is interpreted accordingly
/// (e.g. $push receives an array of partial lists and flattens it).
pub trait Accumulator: Send {
    fn op_name(&self) -> &'static str;

    fn process(&mut self, value: Value, merging: bool) -> Result<()>;

    /// Final (or partial, when `to_be_merged`) result. Running totals
    /// kept in separate representations are merged only here.
    fn value(&self, to_be_merged: bool) -> Value;

    fn reset(&mut self);

    /// Approximate bytes held; drives $group's spill decision.
    fn memory_usage(&self) -> usize;

    /// True when partial results can be combined in any order, which
    /// enables streaming/distributed optimizations.
    fn is_associative_commutative(&self) -> bool {
        false
    }
}

/// Factory signature stored in the registry.
pub type AccumulatorFactory = fn(&ValueComparator) -> Box<dyn Accumulator>;

lazy_static! {
    /// name -> factory, populated once at startup. A name can only be
    /// registered here, so duplicates are impossible by construction;
    /// the debug assertion guards against future edits breaking that.
    static ref ACCUMULATOR_REGISTRY: HashMap<&'static str, AccumulatorFactory> = {
        let mut registry: HashMap<&'static str, AccumulatorFactory> = HashMap::new();
        let mut add = |name: &'static str, factory: AccumulatorFactory| {
            let previous = registry.insert(name, factory);
            debug_assert!(previous.is_none(), "duplicate accumulator: {}", name);
        };
        add("$sum", |_| Box::new(SumAccumulator::new()));
        add("$avg", |_| Box::new(AvgAccumulator::new()));
        add("$min", |cmp| Box::new(MinMaxAccumulator::min(cmp.clone())));
        add("$max", |cmp| Box::new(MinMaxAccumulator::max(cmp.clone())));
        add("$first", |_| Box::new(FirstLastAccumulator::first()));
        add("$last", |_| Box::new(FirstLastAccumulator::last()));
        add("$push", |_| Box::new(PushAccumulator::new()));
        add("$addToSet", |cmp| Box::new(AddToSetAccumulator::new(cmp.clone())));
        add("$stdDevPop", |_| Box::new(StdDevAccumulator::population()));
        add("$stdDevSamp", |_| Box::new(StdDevAccumulator::sample()));
        registry
    };
}

/// Look up an accumulator factory by operator name.
pub fn accumulator_factory(name: &str) -> Result<AccumulatorFactory> {
    ACCUMULATOR_REGISTRY
        .get(name)
        .copied()
        .ok_or_else(|| PipeLiteError::UnknownAccumulator(name.to_string()))
}

/// One `field: {$op: <expression>}` entry of a $group spec.
#[derive(Debug, Clone)]
pub struct AccumulationStatement {
    pub field_name: String,
    pub op_name: String,
    pub argument: Expression,
}

impl AccumulationStatement {
    /// Parse `{"$op": <expr>}`; exactly one operator key is required.
    pub fn parse(field_name: &str, spec: &serde_json::Value) -> Result<AccumulationStatement> {
        let obj = spec.as_object().ok_or_else(|| {
            PipeLiteError::InvalidPipeline(format!(
                "the field '{}' must be an accumulator object",
                field_name
            ))
        })?;
        if obj.len() != 1 {
            return Err(PipeLiteError::InvalidPipeline(format!(
                "the field '{}' must specify one accumulator",
                field_name
            )));
        }
        let (op_name, arg) = obj.iter().next().unwrap();
        // Validate the name eagerly so unknown operators fail at parse
        accumulator_factory(op_name)?;
        Ok(AccumulationStatement {
            field_name: field_name.to_string(),
            op_name: op_name.clone(),
            argument: Expression::parse(arg)?,
        })
    }

    pub fn make_accumulator(&self, cmp: &ValueComparator) -> Box<dyn Accumulator> {
        // The name was validated at parse time
        accumulator_factory(&self.op_name).expect("accumulator disappeared from registry")(cmp)
    }

    pub fn serialize(&self) -> serde_json::Value {
        let mut spec = serde_json::Map::new();
        spec.insert(self.op_name.clone(), self.argument.serialize());
        serde_json::Value::Object(spec)
    }
}

// ============================================================================
// $sum
// ============================================================================

/// Kahan-compensated double total plus an exact integer total, merged
/// only when the value is requested. Non-numeric inputs are ignored.
pub struct SumAccumulator {
    int_total: i64,
    int_overflowed: bool,
    double_total: f64,
    compensation: f64,
    saw_double: bool,
}

impl SumAccumulator {
    pub fn new() -> SumAccumulator {
        SumAccumulator {
            int_total: 0,
            int_overflowed: false,
            double_total: 0.0,
            compensation: 0.0,
            saw_double: false,
        }
    }

    fn add_double(&mut self, d: f64) {
        // Kahan summation
        let y = d - self.compensation;
        let t = self.double_total + y;
        self.compensation = (t - self.double_total) - y;
        self.double_total = t;
    }
}

impl Default for SumAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator for SumAccumulator {
    fn op_name(&self) -> &'static str {
        "$sum"
    }

    fn process(&mut self, value: Value, _merging: bool) -> Result<()> {
        // Partial sums are plain numbers, so merging needs no special
        // interpretation.
        match value {
            Value::Int32(i) => match self.int_total.checked_add(i as i64) {
                Some(t) => self.int_total = t,
                None => {
                    self.int_overflowed = true;
                    self.add_double(i as f64);
                }
            },
            Value::Int64(i) => match self.int_total.checked_add(i) {
                Some(t) => self.int_total = t,
                None => {
                    self.int_overflowed = true;
                    self.add_double(i as f64);
                }
            },
            Value::Double(d) => {
                self.saw_double = true;
                self.add_double(d);
            }
            _ => {}
        }
        Ok(())
    }

    fn value(&self, _to_be_merged: bool) -> Value {
        if self.saw_double || self.int_overflowed {
            Value::Double(self.double_total + self.int_total as f64)
        } else {
            Value::Int64(self.int_total)
        }
    }

    fn reset(&mut self) {
        *self = SumAccumulator::new();
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    fn is_associative_commutative(&self) -> bool {
        true
    }
}

// ============================================================================
// $avg
// ============================================================================

pub struct AvgAccumulator {
    sum: SumAccumulator,
    count: i64,
}

impl AvgAccumulator {
    pub fn new() -> AvgAccumulator {
        AvgAccumulator {
            sum: SumAccumulator::new(),
            count: 0,
        }
    }
}

impl Default for AvgAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator for AvgAccumulator {
    fn op_name(&self) -> &'static str {
        "$avg"
    }

    fn process(&mut self, value: Value, merging: bool) -> Result<()> {
        if merging {
            // Partial form: {sum: <double>, count: <long>}
            if let Value::Object(partial) = value {
                self.sum.process(partial.get_value("sum"), false)?;
                if let Some(c) = partial.get_value("count").as_i64() {
                    self.count += c;
                }
            }
            return Ok(());
        }
        if value.is_numeric() {
            self.sum.process(value, false)?;
            self.count += 1;
        }
        Ok(())
    }

    fn value(&self, to_be_merged: bool) -> Value {
        if to_be_merged {
            let mut partial = DocumentBuilder::new();
            partial.set("sum", Value::Double(self.sum.value(false).as_f64().unwrap_or(0.0)));
            partial.set("count", Value::Int64(self.count));
            return Value::object(partial.freeze());
        }
        if self.count == 0 {
            Value::Null
        } else {
            Value::Double(self.sum.value(false).as_f64().unwrap_or(0.0) / self.count as f64)
        }
    }

    fn reset(&mut self) {
        *self = AvgAccumulator::new();
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    fn is_associative_commutative(&self) -> bool {
        true
    }
}

// ============================================================================
// $min / $max
// ============================================================================

pub struct MinMaxAccumulator {
    best: Option<Value>,
    cmp: ValueComparator,
    want_max: bool,
}

impl MinMaxAccumulator {
    pub fn min(cmp: ValueComparator) -> MinMaxAccumulator {
        MinMaxAccumulator {
            best: None,
            cmp,
            want_max: false,
        }
    }

    pub fn max(cmp: ValueComparator) -> MinMaxAccumulator {
        MinMaxAccumulator {
            best: None,
            cmp,
            want_max: true,
        }
    }
}

impl Accumulator for MinMaxAccumulator {
    fn op_name(&self) -> &'static str {
        if self.want_max {
            "$max"
        } else {
            "$min"
        }
    }

    fn process(&mut self, value: Value, _merging: bool) -> Result<()> {
        if value.is_missing() {
            return Ok(());
        }
        let replace = match &self.best {
            None => true,
            Some(current) => {
                let ord = self.cmp.compare(&value, current);
                if self.want_max {
                    ord == std::cmp::Ordering::Greater
                } else {
                    ord == std::cmp::Ordering::Less
                }
            }
        };
        if replace {
            self.best = Some(value);
        }
        Ok(())
    }

    fn value(&self, _to_be_merged: bool) -> Value {
        self.best.clone().unwrap_or(Value::Null)
    }

    fn reset(&mut self) {
        self.best = None;
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.best.as_ref().map_or(0, Value::approximate_size)
    }

    fn is_associative_commutative(&self) -> bool {
        true
    }
}

// ============================================================================
// $first / $last
// ============================================================================

pub struct FirstLastAccumulator {
    seen: Option<Value>,
    want_last: bool,
}

impl FirstLastAccumulator {
    pub fn first() -> FirstLastAccumulator {
        FirstLastAccumulator {
            seen: None,
            want_last: false,
        }
    }

    pub fn last() -> FirstLastAccumulator {
        FirstLastAccumulator {
            seen: None,
            want_last: true,
        }
    }
}

impl Accumulator for FirstLastAccumulator {
    fn op_name(&self) -> &'static str {
        if self.want_last {
            "$last"
        } else {
            "$first"
        }
    }

    fn process(&mut self, value: Value, _merging: bool) -> Result<()> {
        if self.want_last {
            self.seen = Some(value);
        } else if self.seen.is_none() {
            self.seen = Some(value);
        }
        Ok(())
    }

    fn value(&self, _to_be_merged: bool) -> Value {
        match &self.seen {
            Some(Value::Missing) | None => Value::Null,
            Some(v) => v.clone(),
        }
    }

    fn reset(&mut self) {
        self.seen = None;
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.seen.as_ref().map_or(0, Value::approximate_size)
    }
}

// ============================================================================
// $push
// ============================================================================

pub struct PushAccumulator {
    items: Vec<Value>,
    bytes: usize,
}

impl PushAccumulator {
    pub fn new() -> PushAccumulator {
        PushAccumulator {
            items: Vec::new(),
            bytes: 0,
        }
    }

    fn push_one(&mut self, value: Value) {
        if value.is_missing() {
            return;
        }
        self.bytes += value.approximate_size();
        self.items.push(value);
    }
}

impl Default for PushAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator for PushAccumulator {
    fn op_name(&self) -> &'static str {
        "$push"
    }

    fn process(&mut self, value: Value, merging: bool) -> Result<()> {
        if merging {
            // Partial form: an array of already-pushed values
            if let Value::Array(arr) = value {
                for item in arr.iter() {
                    self.push_one(item.clone());
                }
            }
            return Ok(());
        }
        self.push_one(value);
        Ok(())
    }

    fn value(&self, _to_be_merged: bool) -> Value {
        Value::array(self.items.clone())
    }

    fn reset(&mut self) {
        self.items.clear();
        self.bytes = 0;
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.bytes
    }
}

// ============================================================================
// $addToSet
// ============================================================================

pub struct AddToSetAccumulator {
    /// Canonicalized members, for collator-aware dedup
    seen: AHashSet<Value>,
    /// Original values in first-seen order
    items: Vec<Value>,
    bytes: usize,
    cmp: ValueComparator,
}

impl AddToSetAccumulator {
    pub fn new(cmp: ValueComparator) -> AddToSetAccumulator {
        AddToSetAccumulator {
            seen: AHashSet::new(),
            items: Vec::new(),
            bytes: 0,
            cmp,
        }
    }

    fn insert_one(&mut self, value: Value) {
        if value.is_missing() {
            return;
        }
        let canonical = self.cmp.canonicalize(&value);
        if self.seen.insert(canonical) {
            self.bytes += value.approximate_size();
            self.items.push(value);
        }
    }
}

impl Accumulator for AddToSetAccumulator {
    fn op_name(&self) -> &'static str {
        "$addToSet"
    }

    fn process(&mut self, value: Value, merging: bool) -> Result<()> {
        if merging {
            // Partial form: arrays of partial sets, flattened rather
            // than inserted as single elements
            if let Value::Array(arr) = value {
                for item in arr.iter() {
                    self.insert_one(item.clone());
                }
            }
            return Ok(());
        }
        self.insert_one(value);
        Ok(())
    }

    fn value(&self, _to_be_merged: bool) -> Value {
        Value::array(self.items.clone())
    }

    fn reset(&mut self) {
        self.seen.clear();
        self.items.clear();
        self.bytes = 0;
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + 2 * self.bytes
    }

    fn is_associative_commutative(&self) -> bool {
        true
    }
}

// ============================================================================
// $stdDevPop / $stdDevSamp
// ============================================================================

/// Welford's online algorithm; partials merge through
/// {count, mean, m2}.
pub struct StdDevAccumulator {
    count: i64,
    mean: f64,
    m2: f64,
    sample: bool,
}

impl StdDevAccumulator {
    pub fn population() -> StdDevAccumulator {
        StdDevAccumulator {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            sample: false,
        }
    }

    pub fn sample() -> StdDevAccumulator {
        StdDevAccumulator {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            sample: true,
        }
    }

    fn observe(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn combine(&mut self, count: i64, mean: f64, m2: f64) {
        if count == 0 {
            return;
        }
        if self.count == 0 {
            self.count = count;
            self.mean = mean;
            self.m2 = m2;
            return;
        }
        let total = self.count + count;
        let delta = mean - self.mean;
        self.m2 += m2 + delta * delta * (self.count as f64 * count as f64) / total as f64;
        self.mean += delta * count as f64 / total as f64;
        self.count = total;
    }
}

impl Accumulator for StdDevAccumulator {
    fn op_name(&self) -> &'static str {
        if self.sample {
            "$stdDevSamp"
        } else {
            "$stdDevPop"
        }
    }

    fn process(&mut self, value: Value, merging: bool) -> Result<()> {
        if merging {
            if let Value::Object(partial) = value {
                let count = partial.get_value("count").as_i64().unwrap_or(0);
                let mean = partial.get_value("mean").as_f64().unwrap_or(0.0);
                let m2 = partial.get_value("m2").as_f64().unwrap_or(0.0);
                self.combine(count, mean, m2);
            }
            return Ok(());
        }
        if let Some(x) = value.as_f64() {
            if !value.is_nan() {
                self.observe(x);
            }
        }
        Ok(())
    }

    fn value(&self, to_be_merged: bool) -> Value {
        if to_be_merged {
            let mut partial = DocumentBuilder::new();
            partial.set("count", Value::Int64(self.count));
            partial.set("mean", Value::Double(self.mean));
            partial.set("m2", Value::Double(self.m2));
            return Value::object(partial.freeze());
        }
        let denominator = if self.sample {
            self.count - 1
        } else {
            self.count
        };
        if denominator < 1 {
            Value::Null
        } else {
            Value::Double((self.m2 / denominator as f64).sqrt())
        }
    }

    fn reset(&mut self) {
        let sample = self.sample;
        *self = if sample {
            StdDevAccumulator::sample()
        } else {
            StdDevAccumulator::population()
        };
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    fn is_associative_commutative(&self) -> bool {
        true
    }
}
