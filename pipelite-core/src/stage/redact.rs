// pipelite-core/src/stage/redact.rs
// $redact: expression-driven document pruning
//
// The expression is evaluated against the root document and again at
// every nesting level reached through $$DESCEND. $$KEEP retains the
// current (sub)document wholesale, $$PRUNE drops it with all its
// descendants, and any other result is a fatal user error.

use crate::context::ExpressionContext;
use crate::document::{Document, DocumentBuilder};
use crate::error::{PipeLiteError, Result};
use crate::expression::{Expression, REDACT_DESCEND, REDACT_KEEP, REDACT_PRUNE};
use crate::stage::{
    DocumentSource, GetNextResult, Source, StageConstraints, StageSplit,
};
use crate::value::{Value, ValueComparator};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct RedactStage {
    ctx: Arc<ExpressionContext>,
    cmp: ValueComparator,
    expr: Expression,
    disposed: bool,
}

pub fn parse(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    Ok(Box::new(RedactStage {
        cmp: ctx.value_comparator(),
        expr: Expression::parse(spec)?,
        disposed: false,
        ctx: ctx.clone(),
    }))
}

impl RedactStage {
    /// Apply the redact decision to one document. `None` means the
    /// whole document was pruned.
    fn redact_document(&self, doc: &Document) -> Result<Option<Document>> {
        match self.expr.evaluate(doc, &self.cmp)? {
            Value::String(s) if s == REDACT_KEEP => Ok(Some(doc.clone())),
            Value::String(s) if s == REDACT_PRUNE => Ok(None),
            Value::String(s) if s == REDACT_DESCEND => {
                let mut out = DocumentBuilder::new();
                for (name, value) in doc.iter() {
                    if let Some(redacted) = self.redact_value(value)? {
                        out.set(name, redacted);
                    }
                }
                Ok(Some(out.freeze()))
            }
            other => Err(PipeLiteError::Evaluation(format!(
                "$redact's expression should not return anything aside from the variables \
                 $$KEEP, $$DESCEND, and $$PRUNE, but returned {}",
                other.to_json()
            ))),
        }
    }

    /// Descend into one value: sub-documents re-evaluate the
    /// expression, arrays filter their elements, scalars survive.
    fn redact_value(&self, value: &Value) -> Result<Option<Value>> {
        match value {
            Value::Object(sub) => Ok(self.redact_document(sub)?.map(Value::object)),
            Value::Array(arr) => {
                let mut kept = Vec::new();
                for element in arr.iter() {
                    if let Some(v) = self.redact_value(element)? {
                        kept.push(v);
                    }
                }
                Ok(Some(Value::array(kept)))
            }
            scalar => Ok(Some(scalar.clone())),
        }
    }
}

impl DocumentSource for RedactStage {
    fn source_name(&self) -> &'static str {
        "$redact"
    }

    fn get_next(&mut self, source: &mut dyn Source) -> Result<GetNextResult> {
        if self.disposed {
            return Ok(GetNextResult::Eof);
        }
        loop {
            self.ctx.check_interrupted()?;
            match source.pull()? {
                GetNextResult::Advanced(doc) => {
                    if let Some(redacted) = self.redact_document(&doc)? {
                        return Ok(GetNextResult::Advanced(redacted));
                    }
                }
                other => return Ok(other),
            }
        }
    }

    fn constraints(&self) -> StageConstraints {
        StageConstraints::streaming()
    }

    fn dependencies(&self, deps: &mut BTreeSet<String>) {
        self.expr.add_dependencies(deps);
        // The whole document feeds the recursive descent
        deps.insert(String::new());
    }

    fn serialize(&self, _explain: bool) -> serde_json::Value {
        json!({ "$redact": self.expr.serialize() })
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }

    fn split_for_distribution(self: Box<Self>) -> StageSplit {
        StageSplit::Shard(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
