// pipelite-core/src/expression.rs
// Value expressions: field paths, literals, operators, object specs
//
// These trees back $group ids, computed $project/$addFields fields and
// the $redact condition. Parsing is strict and happens before any
// document flows; evaluation errors abort the pipeline run.

use crate::document::{Document, DocumentBuilder};
use crate::error::{PipeLiteError, Result};
use crate::value::{Value, ValueComparator};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Reserved result markers for $redact. Variable references `$$KEEP`,
/// `$$PRUNE` and `$$DESCEND` evaluate to these strings; the redact
/// stage matches on them exactly.
pub const REDACT_KEEP: &str = "$$KEEP";
pub const REDACT_PRUNE: &str = "$$PRUNE";
pub const REDACT_DESCEND: &str = "$$DESCEND";

/// A parsed value expression.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A constant
    Literal(Value),
    /// `"$a.b"` - read a (possibly dotted) path off the input document
    FieldPath(String),
    /// `"$$NAME"` or `"$$NAME.path"` - system variable reference
    Variable { name: String, path: Option<String> },
    /// `[expr, ...]` - array literal with evaluated elements
    ArrayLit(Vec<Expression>),
    /// `{field: expr, ...}` - object spec with evaluated values
    Object(Vec<(String, Expression)>),
    /// `{"$op": [args...]}` - named operator application
    Operator { op: ExprOp, args: Vec<Expression> },
}

/// The operator vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Cmp,
    And,
    Or,
    Not,
    Cond,
    IfNull,
    Add,
    Subtract,
    Multiply,
    Divide,
    Concat,
    ToLower,
    ToUpper,
    Size,
}

impl ExprOp {
    fn parse(name: &str) -> Option<ExprOp> {
        match name {
            "$eq" => Some(ExprOp::Eq),
            "$ne" => Some(ExprOp::Ne),
            "$gt" => Some(ExprOp::Gt),
            "$gte" => Some(ExprOp::Gte),
            "$lt" => Some(ExprOp::Lt),
            "$lte" => Some(ExprOp::Lte),
            "$cmp" => Some(ExprOp::Cmp),
            "$and" => Some(ExprOp::And),
            "$or" => Some(ExprOp::Or),
            "$not" => Some(ExprOp::Not),
            "$cond" => Some(ExprOp::Cond),
            "$ifNull" => Some(ExprOp::IfNull),
            "$add" => Some(ExprOp::Add),
            "$subtract" => Some(ExprOp::Subtract),
            "$multiply" => Some(ExprOp::Multiply),
            "$divide" => Some(ExprOp::Divide),
            "$concat" => Some(ExprOp::Concat),
            "$toLower" => Some(ExprOp::ToLower),
            "$toUpper" => Some(ExprOp::ToUpper),
            "$size" => Some(ExprOp::Size),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ExprOp::Eq => "$eq",
            ExprOp::Ne => "$ne",
            ExprOp::Gt => "$gt",
            ExprOp::Gte => "$gte",
            ExprOp::Lt => "$lt",
            ExprOp::Lte => "$lte",
            ExprOp::Cmp => "$cmp",
            ExprOp::And => "$and",
            ExprOp::Or => "$or",
            ExprOp::Not => "$not",
            ExprOp::Cond => "$cond",
            ExprOp::IfNull => "$ifNull",
            ExprOp::Add => "$add",
            ExprOp::Subtract => "$subtract",
            ExprOp::Multiply => "$multiply",
            ExprOp::Divide => "$divide",
            ExprOp::Concat => "$concat",
            ExprOp::ToLower => "$toLower",
            ExprOp::ToUpper => "$toUpper",
            ExprOp::Size => "$size",
        }
    }
}

impl Expression {
    /// Parse an expression spec.
    ///
    /// Strings starting with `$` are field paths, `$$` variables;
    /// single-`$`-key objects are operators; other objects are object
    /// specs whose keys must all be plain field names.
    pub fn parse(spec: &serde_json::Value) -> Result<Expression> {
        match spec {
            serde_json::Value::String(s) => {
                if let Some(var) = s.strip_prefix("$$") {
                    if var.is_empty() {
                        return Err(PipeLiteError::InvalidExpression(
                            "empty variable reference".to_string(),
                        ));
                    }
                    let (name, path) = match var.split_once('.') {
                        Some((name, path)) => (name.to_string(), Some(path.to_string())),
                        None => (var.to_string(), None),
                    };
                    Ok(Expression::Variable { name, path })
                } else if let Some(path) = s.strip_prefix('$') {
                    if path.is_empty() {
                        return Err(PipeLiteError::InvalidExpression(
                            "empty field path".to_string(),
                        ));
                    }
                    Ok(Expression::FieldPath(path.to_string()))
                } else {
                    Ok(Expression::Literal(Value::String(s.clone())))
                }
            }
            serde_json::Value::Array(items) => Ok(Expression::ArrayLit(
                items.iter().map(Expression::parse).collect::<Result<_>>()?,
            )),
            serde_json::Value::Object(map) => Self::parse_object(map),
            other => Ok(Expression::Literal(Value::from_json(other))),
        }
    }

    fn parse_object(map: &serde_json::Map<String, serde_json::Value>) -> Result<Expression> {
        let dollar_keys = map.keys().filter(|k| k.starts_with('$')).count();
        if dollar_keys > 0 {
            if map.len() != 1 {
                return Err(PipeLiteError::InvalidExpression(
                    "an expression specification must contain exactly one operator".to_string(),
                ));
            }
            let (op_name, arg) = map.iter().next().unwrap();

            if op_name == "$literal" {
                return Ok(Expression::Literal(Value::from_json(arg)));
            }

            let op = ExprOp::parse(op_name).ok_or_else(|| {
                PipeLiteError::InvalidExpression(format!(
                    "unknown expression operator: {}",
                    op_name
                ))
            })?;
            let args = Self::parse_args(op, arg)?;
            Self::check_arity(op, args.len())?;
            Ok(Expression::Operator { op, args })
        } else {
            let mut fields = Vec::new();
            for (k, v) in map {
                fields.push((k.clone(), Expression::parse(v)?));
            }
            Ok(Expression::Object(fields))
        }
    }

    fn parse_args(op: ExprOp, arg: &serde_json::Value) -> Result<Vec<Expression>> {
        // $cond accepts the {if, then, else} document form
        if op == ExprOp::Cond {
            if let serde_json::Value::Object(map) = arg {
                let get = |key: &str| {
                    map.get(key).ok_or_else(|| {
                        PipeLiteError::InvalidExpression(format!(
                            "$cond requires '{}' when given an object",
                            key
                        ))
                    })
                };
                return Ok(vec![
                    Expression::parse(get("if")?)?,
                    Expression::parse(get("then")?)?,
                    Expression::parse(get("else")?)?,
                ]);
            }
        }
        match arg {
            serde_json::Value::Array(items) => {
                items.iter().map(Expression::parse).collect::<Result<_>>()
            }
            single => Ok(vec![Expression::parse(single)?]),
        }
    }

    fn check_arity(op: ExprOp, n: usize) -> Result<()> {
        let ok = match op {
            ExprOp::Eq
            | ExprOp::Ne
            | ExprOp::Gt
            | ExprOp::Gte
            | ExprOp::Lt
            | ExprOp::Lte
            | ExprOp::Cmp
            | ExprOp::Subtract
            | ExprOp::Divide => n == 2,
            ExprOp::Not | ExprOp::ToLower | ExprOp::ToUpper | ExprOp::Size => n == 1,
            ExprOp::Cond => n == 3,
            ExprOp::IfNull => n == 2,
            ExprOp::And | ExprOp::Or | ExprOp::Add | ExprOp::Multiply | ExprOp::Concat => n >= 1,
        };
        if ok {
            Ok(())
        } else {
            Err(PipeLiteError::InvalidExpression(format!(
                "wrong number of arguments to {}: {}",
                op.name(),
                n
            )))
        }
    }

    /// Evaluate against a document. `cmp` carries the pipeline's
    /// collator so string comparison stays consistent engine-wide.
    pub fn evaluate(&self, doc: &Document, cmp: &ValueComparator) -> Result<Value> {
        match self {
            Expression::Literal(v) => Ok(v.clone()),
            Expression::FieldPath(path) => Ok(doc.get_path(path)),
            Expression::Variable { name, path } => {
                let base = match name.as_str() {
                    "ROOT" | "CURRENT" => Value::object(doc.clone()),
                    "KEEP" => Value::string(REDACT_KEEP),
                    "PRUNE" => Value::string(REDACT_PRUNE),
                    "DESCEND" => Value::string(REDACT_DESCEND),
                    "REMOVE" => Value::Missing,
                    other => {
                        return Err(PipeLiteError::InvalidExpression(format!(
                            "undefined variable: $${}",
                            other
                        )))
                    }
                };
                match (path, &base) {
                    (Some(p), Value::Object(d)) => Ok(d.get_path(p)),
                    (Some(_), _) => Ok(Value::Missing),
                    (None, _) => Ok(base),
                }
            }
            Expression::ArrayLit(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.evaluate(doc, cmp)?);
                }
                Ok(Value::array(out))
            }
            Expression::Object(fields) => {
                let mut builder = DocumentBuilder::new();
                for (name, expr) in fields {
                    let v = expr.evaluate(doc, cmp)?;
                    // Missing fields are dropped from object results
                    if !v.is_missing() {
                        builder.set(name, v);
                    }
                }
                Ok(Value::object(builder.freeze()))
            }
            Expression::Operator { op, args } => Self::apply(*op, args, doc, cmp),
        }
    }

    fn apply(
        op: ExprOp,
        args: &[Expression],
        doc: &Document,
        cmp: &ValueComparator,
    ) -> Result<Value> {
        match op {
            ExprOp::Eq | ExprOp::Ne | ExprOp::Gt | ExprOp::Gte | ExprOp::Lt | ExprOp::Lte => {
                let a = args[0].evaluate(doc, cmp)?;
                let b = args[1].evaluate(doc, cmp)?;
                let ord = cmp.compare(&a, &b);
                let result = match op {
                    ExprOp::Eq => ord == Ordering::Equal,
                    ExprOp::Ne => ord != Ordering::Equal,
                    ExprOp::Gt => ord == Ordering::Greater,
                    ExprOp::Gte => ord != Ordering::Less,
                    ExprOp::Lt => ord == Ordering::Less,
                    ExprOp::Lte => ord != Ordering::Greater,
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
            ExprOp::Cmp => {
                let a = args[0].evaluate(doc, cmp)?;
                let b = args[1].evaluate(doc, cmp)?;
                Ok(Value::Int32(match cmp.compare(&a, &b) {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }))
            }
            ExprOp::And => {
                for arg in args {
                    if !arg.evaluate(doc, cmp)?.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            ExprOp::Or => {
                for arg in args {
                    if arg.evaluate(doc, cmp)?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            ExprOp::Not => Ok(Value::Bool(!args[0].evaluate(doc, cmp)?.is_truthy())),
            ExprOp::Cond => {
                if args[0].evaluate(doc, cmp)?.is_truthy() {
                    args[1].evaluate(doc, cmp)
                } else {
                    args[2].evaluate(doc, cmp)
                }
            }
            ExprOp::IfNull => {
                let first = args[0].evaluate(doc, cmp)?;
                if first.is_nullish() {
                    args[1].evaluate(doc, cmp)
                } else {
                    Ok(first)
                }
            }
            ExprOp::Add | ExprOp::Multiply => Self::fold_arithmetic(op, args, doc, cmp),
            ExprOp::Subtract | ExprOp::Divide => {
                let a = args[0].evaluate(doc, cmp)?;
                let b = args[1].evaluate(doc, cmp)?;
                if a.is_nullish() || b.is_nullish() {
                    return Ok(Value::Null);
                }
                match op {
                    ExprOp::Subtract => numeric_binop(&a, &b, "$subtract", |x, y| x - y, |x, y| {
                        x.checked_sub(y)
                    }),
                    ExprOp::Divide => {
                        let (x, y) = (
                            a.as_f64().ok_or_else(|| type_error("$divide", &a))?,
                            b.as_f64().ok_or_else(|| type_error("$divide", &b))?,
                        );
                        if y == 0.0 {
                            return Err(PipeLiteError::Evaluation(
                                "$divide by zero".to_string(),
                            ));
                        }
                        Ok(Value::Double(x / y))
                    }
                    _ => unreachable!(),
                }
            }
            ExprOp::Concat => {
                let mut out = String::new();
                for arg in args {
                    let v = arg.evaluate(doc, cmp)?;
                    if v.is_nullish() {
                        return Ok(Value::Null);
                    }
                    match v {
                        Value::String(s) => out.push_str(&s),
                        other => return Err(type_error("$concat", &other)),
                    }
                }
                Ok(Value::String(out))
            }
            ExprOp::ToLower | ExprOp::ToUpper => {
                let v = args[0].evaluate(doc, cmp)?;
                if v.is_nullish() {
                    return Ok(Value::string(""));
                }
                match v {
                    Value::String(s) => Ok(Value::String(if op == ExprOp::ToLower {
                        s.to_lowercase()
                    } else {
                        s.to_uppercase()
                    })),
                    other => Err(type_error(op.name(), &other)),
                }
            }
            ExprOp::Size => {
                let v = args[0].evaluate(doc, cmp)?;
                match v {
                    Value::Array(arr) => Ok(Value::Int64(arr.len() as i64)),
                    other => Err(type_error("$size", &other)),
                }
            }
        }
    }

    fn fold_arithmetic(
        op: ExprOp,
        args: &[Expression],
        doc: &Document,
        cmp: &ValueComparator,
    ) -> Result<Value> {
        let mut acc = if op == ExprOp::Add {
            Value::Int64(0)
        } else {
            Value::Int64(1)
        };
        for arg in args {
            let v = arg.evaluate(doc, cmp)?;
            if v.is_nullish() {
                return Ok(Value::Null);
            }
            acc = match op {
                ExprOp::Add => numeric_binop(&acc, &v, "$add", |x, y| x + y, |x, y| {
                    x.checked_add(y)
                })?,
                ExprOp::Multiply => numeric_binop(&acc, &v, "$multiply", |x, y| x * y, |x, y| {
                    x.checked_mul(y)
                })?,
                _ => unreachable!(),
            };
        }
        Ok(acc)
    }

    /// Serialize back to the stage-spec form; `parse(serialize(e))`
    /// yields an equivalent expression.
    pub fn serialize(&self) -> serde_json::Value {
        match self {
            Expression::Literal(v) => json!({ "$literal": v.to_json() }),
            Expression::FieldPath(p) => json!(format!("${}", p)),
            Expression::Variable { name, path } => match path {
                Some(p) => json!(format!("$${}.{}", name, p)),
                None => json!(format!("$${}", name)),
            },
            Expression::ArrayLit(items) => {
                json!(items.iter().map(Expression::serialize).collect::<Vec<_>>())
            }
            Expression::Object(fields) => {
                let mut map = serde_json::Map::new();
                for (k, e) in fields {
                    map.insert(k.clone(), e.serialize());
                }
                serde_json::Value::Object(map)
            }
            Expression::Operator { op, args } => {
                json!({ op.name(): args.iter().map(Expression::serialize).collect::<Vec<_>>() })
            }
        }
    }

    /// Collect every field path this expression reads.
    pub fn add_dependencies(&self, deps: &mut BTreeSet<String>) {
        match self {
            Expression::Literal(_) => {}
            Expression::FieldPath(p) => {
                deps.insert(p.clone());
            }
            Expression::Variable { name, .. } => {
                // $$ROOT / $$CURRENT depend on the whole document
                if name == "ROOT" || name == "CURRENT" {
                    deps.insert(String::new());
                }
            }
            Expression::ArrayLit(items) => {
                for item in items {
                    item.add_dependencies(deps);
                }
            }
            Expression::Object(fields) => {
                for (_, e) in fields {
                    e.add_dependencies(deps);
                }
            }
            Expression::Operator { args, .. } => {
                for arg in args {
                    arg.add_dependencies(deps);
                }
            }
        }
    }
}

fn type_error(op: &str, v: &Value) -> PipeLiteError {
    PipeLiteError::Evaluation(format!("{} got a value of type {}", op, v.type_name()))
}

/// Int-preserving arithmetic: both-int stays Int64 unless it
/// overflows, any double widens to Double.
fn numeric_binop(
    a: &Value,
    b: &Value,
    op: &str,
    f: impl Fn(f64, f64) -> f64,
    i: impl Fn(i64, i64) -> Option<i64>,
) -> Result<Value> {
    if !a.is_numeric() {
        return Err(type_error(op, a));
    }
    if !b.is_numeric() {
        return Err(type_error(op, b));
    }
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => match i(x, y) {
            Some(r) => Ok(Value::Int64(r)),
            None => Ok(Value::Double(f(x as f64, y as f64))),
        },
        _ => Ok(Value::Double(f(
            a.as_f64().unwrap_or(f64::NAN),
            b.as_f64().unwrap_or(f64::NAN),
        ))),
    }
}
