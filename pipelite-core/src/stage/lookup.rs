// pipelite-core/src/stage/lookup.rs
// $lookup: equality join against a foreign namespace via the process
// delegate, with a shared LRU result cache and $unwind absorption

use crate::context::{ExpressionContext, Namespace};
use crate::document::{Document, DocumentBuilder};
use crate::error::{PipeLiteError, Result};
use crate::lookup_cache::LookupSetCache;
use crate::stage::unwind::{UnwindSpec, UnwindStage};
use crate::stage::{
    DocumentSource, GetNextResult, HostTypeRequirement, ModifiedPaths, Source,
    StageConstraints, StageSplit,
};
use crate::value::Value;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct LookupStage {
    ctx: Arc<ExpressionContext>,
    from: Namespace,
    local_field: String,
    foreign_field: String,
    as_field: String,
    cache: LookupSetCache,
    /// A following $unwind on the as-field, fused in by the optimizer
    /// so the joined array never outlives one input document
    absorbed_unwind: Option<UnwindSpec>,
    pending: Vec<Document>,
    disposed: bool,
}

pub fn parse(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    let obj = spec.as_object().ok_or_else(|| {
        PipeLiteError::InvalidPipeline("the $lookup specification must be an object".into())
    })?;
    let get_string = |key: &str| -> Result<String> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                PipeLiteError::InvalidPipeline(format!(
                    "$lookup requires a string '{}' field",
                    key
                ))
            })
    };
    for key in obj.keys() {
        if !matches!(key.as_str(), "from" | "localField" | "foreignField" | "as") {
            return Err(PipeLiteError::InvalidPipeline(format!(
                "unknown argument to $lookup: {}",
                key
            )));
        }
    }
    Ok(Box::new(LookupStage {
        from: ctx.namespace.with_coll(get_string("from")?),
        local_field: get_string("localField")?,
        foreign_field: get_string("foreignField")?,
        as_field: get_string("as")?,
        cache: LookupSetCache::new(ctx.value_comparator()),
        absorbed_unwind: None,
        pending: Vec::new(),
        disposed: false,
        ctx: ctx.clone(),
    }))
}

impl LookupStage {
    pub fn absorbed_unwind(&self) -> Option<&UnwindSpec> {
        self.absorbed_unwind.as_ref()
    }

    /// Foreign matches for one key, through the cache. The delegate is
    /// expected to treat a null key as matching null and missing
    /// foreign fields.
    fn foreign_matches(&mut self, key: &Value) -> Result<Vec<Document>> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit.to_vec());
        }
        let found = self
            .ctx
            .process_interface()?
            .find_by_key(&self.from, &self.foreign_field, key)?;
        for doc in &found {
            self.cache.insert(key, doc.clone());
        }
        self.cache
            .evict_down_to(self.ctx.options.lookup_cache_max_bytes);
        Ok(found)
    }

    fn join_one(&mut self, doc: &Document) -> Result<Vec<Document>> {
        let local = match doc.get_path(&self.local_field) {
            // An absent local field joins like null
            Value::Missing => Value::Null,
            v => v,
        };
        let matched = self.foreign_matches(&local)?;

        let mut joined = DocumentBuilder::from_document(doc);
        joined.set_path(
            &self.as_field,
            Value::array(matched.into_iter().map(Value::object).collect()),
        );
        let joined = joined.freeze();

        Ok(match &self.absorbed_unwind {
            Some(spec) => spec.unwind(&joined),
            None => vec![joined],
        })
    }
}

impl DocumentSource for LookupStage {
    fn source_name(&self) -> &'static str {
        "$lookup"
    }

    fn get_next(&mut self, source: &mut dyn Source) -> Result<GetNextResult> {
        if self.disposed {
            return Ok(GetNextResult::Eof);
        }
        loop {
            self.ctx.check_interrupted()?;
            if !self.pending.is_empty() {
                return Ok(GetNextResult::Advanced(self.pending.remove(0)));
            }
            match source.pull()? {
                GetNextResult::Advanced(doc) => {
                    self.pending = self.join_one(&doc)?;
                }
                other => return Ok(other),
            }
        }
    }

    fn constraints(&self) -> StageConstraints {
        let mut constraints = StageConstraints::streaming();
        constraints.host_requirement = HostTypeRequirement::PrimaryShard;
        constraints
    }

    fn modified_paths(&self) -> ModifiedPaths {
        let mut paths: BTreeSet<String> = [self.as_field.clone()].into_iter().collect();
        if let Some(spec) = &self.absorbed_unwind {
            if let Some(f) = &spec.include_array_index {
                paths.insert(f.clone());
            }
        }
        ModifiedPaths::FiniteSet(paths)
    }

    fn can_swap_with_match(&self) -> bool {
        true
    }

    fn dependencies(&self, deps: &mut BTreeSet<String>) {
        deps.insert(self.local_field.clone());
    }

    fn serialize(&self, explain: bool) -> serde_json::Value {
        let mut spec = serde_json::Map::new();
        spec.insert("from".into(), json!(self.from.coll));
        spec.insert("localField".into(), json!(self.local_field));
        spec.insert("foreignField".into(), json!(self.foreign_field));
        spec.insert("as".into(), json!(self.as_field));
        if explain {
            if let Some(unwind) = &self.absorbed_unwind {
                spec.insert("unwinding".into(), unwind.serialize());
            }
        }
        json!({ "$lookup": serde_json::Value::Object(spec) })
    }

    fn try_absorb(
        &mut self,
        next: Box<dyn DocumentSource>,
    ) -> std::result::Result<(), Box<dyn DocumentSource>> {
        if self.absorbed_unwind.is_none() {
            if let Some(unwind) = next.as_any().downcast_ref::<UnwindStage>() {
                if unwind.spec().path == self.as_field {
                    self.absorbed_unwind = Some(unwind.spec().clone());
                    return Ok(());
                }
            }
        }
        Err(next)
    }

    fn dispose(&mut self) {
        self.cache.clear();
        self.pending.clear();
        self.disposed = true;
    }

    fn split_for_distribution(self: Box<Self>) -> StageSplit {
        // Foreign-collection access happens on the merging host only
        StageSplit::SplitPoint {
            shard: None,
            merge: self,
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
