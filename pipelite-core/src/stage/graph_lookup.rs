// pipelite-core/src/stage/graph_lookup.rs
// $graphLookup: breadth-first expansion over a foreign namespace
//
// Starting from the startWith value(s), each round queries the
// foreign collection for documents whose connectToField matches a
// frontier value, records unseen documents with their depth, and
// seeds the next frontier from their connectFromField. A hard memory
// ceiling covers frontier + visited + cache together; the cache is
// evicted first when the ceiling is hit.

use crate::context::{ExpressionContext, Namespace};
use crate::document::{Document, DocumentBuilder};
use crate::error::{PipeLiteError, Result};
use crate::expression::Expression;
use crate::lookup_cache::LookupSetCache;
use crate::matcher::MatchExpression;
use crate::stage::unwind::{UnwindSpec, UnwindStage};
use crate::stage::{
    DocumentSource, GetNextResult, HostTypeRequirement, ModifiedPaths, Source,
    StageConstraints, StageSplit,
};
use crate::value::{Value, ValueComparator};
use ahash::AHashSet;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct GraphLookupStage {
    ctx: Arc<ExpressionContext>,
    cmp: ValueComparator,
    from: Namespace,
    start_with: Expression,
    connect_from_field: String,
    connect_to_field: String,
    as_field: String,
    max_depth: Option<u64>,
    depth_field: Option<String>,
    restrict_search: Option<MatchExpression>,
    cache: LookupSetCache,
    absorbed_unwind: Option<UnwindSpec>,
    pending: Vec<Document>,
    disposed: bool,
}

pub fn parse(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    let obj = spec.as_object().ok_or_else(|| {
        PipeLiteError::InvalidPipeline("the $graphLookup specification must be an object".into())
    })?;
    let get_string = |key: &str| -> Result<String> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                PipeLiteError::InvalidPipeline(format!(
                    "$graphLookup requires a string '{}' field",
                    key
                ))
            })
    };
    for key in obj.keys() {
        if !matches!(
            key.as_str(),
            "from"
                | "startWith"
                | "connectFromField"
                | "connectToField"
                | "as"
                | "maxDepth"
                | "depthField"
                | "restrictSearchWithMatch"
        ) {
            return Err(PipeLiteError::InvalidPipeline(format!(
                "unknown argument to $graphLookup: {}",
                key
            )));
        }
    }
    let start_with = obj.get("startWith").ok_or_else(|| {
        PipeLiteError::InvalidPipeline("$graphLookup requires a 'startWith' field".into())
    })?;
    let max_depth = obj
        .get("maxDepth")
        .map(|v| {
            v.as_u64().ok_or_else(|| {
                PipeLiteError::InvalidPipeline(
                    "maxDepth requires a non-negative integer argument".into(),
                )
            })
        })
        .transpose()?;
    let depth_field = obj
        .get("depthField")
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| {
                PipeLiteError::InvalidPipeline("depthField requires a string argument".into())
            })
        })
        .transpose()?;
    let restrict_search = obj
        .get("restrictSearchWithMatch")
        .map(|v| {
            let mut expr = MatchExpression::parse(v)?;
            expr.set_collator(ctx.collator_arc());
            Ok::<_, PipeLiteError>(expr)
        })
        .transpose()?;

    Ok(Box::new(GraphLookupStage {
        cmp: ctx.value_comparator(),
        from: ctx.namespace.with_coll(get_string("from")?),
        start_with: Expression::parse(start_with)?,
        connect_from_field: get_string("connectFromField")?,
        connect_to_field: get_string("connectToField")?,
        as_field: get_string("as")?,
        max_depth,
        depth_field,
        restrict_search,
        cache: LookupSetCache::new(ctx.value_comparator()),
        absorbed_unwind: None,
        pending: Vec::new(),
        disposed: false,
        ctx: ctx.clone(),
    }))
}

impl GraphLookupStage {
    fn foreign_matches(&mut self, key: &Value) -> Result<Vec<Document>> {
        let found = match self.cache.get(key) {
            Some(hit) => hit.to_vec(),
            None => {
                let found = self.ctx.process_interface()?.find_by_key(
                    &self.from,
                    &self.connect_to_field,
                    key,
                )?;
                for doc in &found {
                    self.cache.insert(key, doc.clone());
                }
                found
            }
        };
        Ok(match &self.restrict_search {
            Some(filter) => found.into_iter().filter(|d| filter.matches(d)).collect(),
            None => found,
        })
    }

    /// One complete breadth-first search for a single input document.
    fn traverse(&mut self, doc: &Document) -> Result<Vec<(Document, u64)>> {
        let mut visited: Vec<(Document, u64)> = Vec::new();
        let mut visited_keys: AHashSet<Value> = AHashSet::new();
        let mut visited_bytes = 0usize;

        let start = self.start_with.evaluate(doc, &self.cmp)?;
        let mut frontier: Vec<Value> = match start {
            Value::Array(arr) => arr.iter().cloned().collect(),
            Value::Missing => Vec::new(),
            single => vec![single],
        };
        let mut frontier_bytes: usize =
            frontier.iter().map(Value::approximate_size).sum();

        let mut depth = 0u64;
        while !frontier.is_empty() {
            self.ctx.check_interrupted()?;
            let mut next_frontier: Vec<Value> = Vec::new();
            let mut next_bytes = 0usize;

            for value in frontier.drain(..) {
                for found in self.foreign_matches(&value)? {
                    // Documents are deduplicated by their _id (or by
                    // whole-document identity when no _id exists)
                    let id = match found.get("_id") {
                        Some(id) => id.clone(),
                        None => Value::object(found.clone()),
                    };
                    let id = self.cmp.canonicalize(&id);
                    if !visited_keys.insert(id.clone()) {
                        continue;
                    }
                    visited_bytes += id.approximate_size() + found.approximate_size();

                    let connect_from = found.get_path(&self.connect_from_field);
                    match connect_from {
                        Value::Array(arr) => {
                            for v in arr.iter() {
                                next_bytes += v.approximate_size();
                                next_frontier.push(v.clone());
                            }
                        }
                        Value::Missing => {}
                        single => {
                            next_bytes += single.approximate_size();
                            next_frontier.push(single);
                        }
                    }
                    visited.push((found, depth));
                }
            }

            self.enforce_memory_ceiling(frontier_bytes + next_bytes, visited_bytes)?;

            if let Some(max) = self.max_depth {
                if depth >= max {
                    break;
                }
            }
            frontier = next_frontier;
            frontier_bytes = next_bytes;
            depth += 1;
        }
        Ok(visited)
    }

    /// Frontier + visited + cache share one ceiling; the cache gives
    /// way first.
    fn enforce_memory_ceiling(&mut self, frontier_bytes: usize, visited_bytes: usize) -> Result<()> {
        let ceiling = self.ctx.options.max_graph_lookup_memory_bytes;
        let pinned = frontier_bytes + visited_bytes;
        if pinned + self.cache.bytes() <= ceiling {
            return Ok(());
        }
        self.cache.evict_down_to(ceiling.saturating_sub(pinned));
        if pinned > ceiling {
            return Err(PipeLiteError::MemoryLimitExceeded(
                "$graphLookup reached maximum memory consumption".into(),
            ));
        }
        Ok(())
    }

    fn expand_one(&mut self, doc: &Document) -> Result<Vec<Document>> {
        let visited = self.traverse(doc)?;
        let members: Vec<Value> = visited
            .into_iter()
            .map(|(found, depth)| match &self.depth_field {
                Some(field) => {
                    let mut with_depth = DocumentBuilder::from_document(&found);
                    with_depth.set_path(field, Value::Int64(depth as i64));
                    Value::object(with_depth.freeze())
                }
                None => Value::object(found),
            })
            .collect();

        let mut out = DocumentBuilder::from_document(doc);
        out.set_path(&self.as_field, Value::array(members));
        let out = out.freeze();

        Ok(match &self.absorbed_unwind {
            Some(spec) => spec.unwind(&out),
            None => vec![out],
        })
    }
}

impl DocumentSource for GraphLookupStage {
    fn source_name(&self) -> &'static str {
        "$graphLookup"
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
                    self.pending = self.expand_one(&doc)?;
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
        ModifiedPaths::FiniteSet([self.as_field.clone()].into_iter().collect())
    }

    fn can_swap_with_match(&self) -> bool {
        true
    }

    fn dependencies(&self, deps: &mut BTreeSet<String>) {
        self.start_with.add_dependencies(deps);
    }

    fn serialize(&self, _explain: bool) -> serde_json::Value {
        let mut spec = serde_json::Map::new();
        spec.insert("from".into(), json!(self.from.coll));
        spec.insert("startWith".into(), self.start_with.serialize());
        spec.insert("connectFromField".into(), json!(self.connect_from_field));
        spec.insert("connectToField".into(), json!(self.connect_to_field));
        spec.insert("as".into(), json!(self.as_field));
        if let Some(max) = self.max_depth {
            spec.insert("maxDepth".into(), json!(max));
        }
        if let Some(field) = &self.depth_field {
            spec.insert("depthField".into(), json!(field));
        }
        if let Some(filter) = &self.restrict_search {
            spec.insert("restrictSearchWithMatch".into(), filter.serialize());
        }
        json!({ "$graphLookup": serde_json::Value::Object(spec) })
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{PipelineOptions, ProcessInterface};
    use crate::stage::source::QueueStage;
    use crate::stage::NoSource;
    use serde_json::json;

    struct FixtureProcess {
        foreign: Vec<Document>,
    }

    impl ProcessInterface for FixtureProcess {
        fn find_by_key(
            &self,
            _ns: &Namespace,
            field: &str,
            key: &Value,
        ) -> Result<Vec<Document>> {
            Ok(self
                .foreign
                .iter()
                .filter(|d| {
                    let v = d.get_path(field);
                    match &v {
                        Value::Array(arr) => arr.iter().any(|e| e == key),
                        other => other == key,
                    }
                })
                .cloned()
                .collect())
        }

        fn run_pipeline(
            &self,
            _ns: &Namespace,
            _stages: &[serde_json::Value],
        ) -> Result<Vec<Document>> {
            Ok(Vec::new())
        }

        fn collection_stats(&self, _ns: &Namespace) -> Result<Document> {
            Ok(Document::new())
        }
    }

    fn reports_chain() -> Arc<FixtureProcess> {
        // dev -> lead -> boss reporting chain
        Arc::new(FixtureProcess {
            foreign: vec![
                Document::from_json(&json!({"_id": "dev", "reportsTo": "lead"})),
                Document::from_json(&json!({"_id": "lead", "reportsTo": "boss"})),
                Document::from_json(&json!({"_id": "boss"})),
            ],
        })
    }

    fn ctx_with(process: Arc<FixtureProcess>) -> Arc<ExpressionContext> {
        Arc::new(
            ExpressionContext::new(Namespace::new("test", "people"))
                .with_process_interface(process),
        )
    }

    fn graph_spec() -> serde_json::Value {
        json!({
            "from": "people",
            "startWith": "$reportsTo",
            "connectFromField": "reportsTo",
            "connectToField": "_id",
            "as": "chain"
        })
    }

    struct PullFrom<'a>(&'a mut QueueStage);

    impl Source for PullFrom<'_> {
        fn pull(&mut self) -> Result<GetNextResult> {
            let mut none = NoSource;
            self.0.get_next(&mut none)
        }
    }

    fn run_one(
        ctx: &Arc<ExpressionContext>,
        spec: serde_json::Value,
        input: serde_json::Value,
    ) -> Document {
        let mut queue =
            QueueStage::with_documents(ctx.clone(), vec![Document::from_json(&input)]);
        let mut stage = parse(&spec, ctx).unwrap();
        let mut src = PullFrom(&mut queue);
        stage.get_next(&mut src).unwrap().document().unwrap()
    }

    #[test]
    fn test_parse_errors() {
        let ctx = ctx_with(reports_chain());
        assert!(parse(&json!("x"), &ctx).is_err());
        assert!(parse(&json!({"from": "people"}), &ctx).is_err());
        let mut bad = graph_spec();
        bad["maxDepth"] = json!("two");
        assert!(parse(&bad, &ctx).is_err());
        let mut unknown = graph_spec();
        unknown["bogus"] = json!(1);
        assert!(parse(&unknown, &ctx).is_err());
    }

    #[test]
    fn test_traverses_whole_chain() {
        let ctx = ctx_with(reports_chain());
        let out = run_one(&ctx, graph_spec(), json!({"name": "dev", "reportsTo": "lead"}));
        let chain = out.get_value("chain");
        let chain = chain.as_array().unwrap();
        assert_eq!(chain.len(), 2); // lead (depth 0), boss (depth 1)
    }

    #[test]
    fn test_max_depth_limits_expansion() {
        let ctx = ctx_with(reports_chain());
        let mut spec = graph_spec();
        spec["maxDepth"] = json!(0);
        let out = run_one(&ctx, spec, json!({"reportsTo": "lead"}));
        assert_eq!(out.get_value("chain").as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_depth_field() {
        let ctx = ctx_with(reports_chain());
        let mut spec = graph_spec();
        spec["depthField"] = json!("level");
        let out = run_one(&ctx, spec, json!({"reportsTo": "lead"}));
        let chain = out.get_value("chain");
        let chain = chain.as_array().unwrap();
        let levels: Vec<Value> = chain
            .iter()
            .map(|m| m.as_object().unwrap().get_value("level"))
            .collect();
        assert!(levels.contains(&Value::Int64(0)));
        assert!(levels.contains(&Value::Int64(1)));
    }

    #[test]
    fn test_cycle_terminates_via_dedup() {
        // a -> b -> a
        let process = Arc::new(FixtureProcess {
            foreign: vec![
                Document::from_json(&json!({"_id": "a", "next": "b"})),
                Document::from_json(&json!({"_id": "b", "next": "a"})),
            ],
        });
        let ctx = ctx_with(process);
        let spec = json!({
            "from": "graph",
            "startWith": "$start",
            "connectFromField": "next",
            "connectToField": "_id",
            "as": "reached"
        });
        let out = run_one(&ctx, spec, json!({"start": "a"}));
        assert_eq!(out.get_value("reached").as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_array_connect_from_fans_out() {
        let process = Arc::new(FixtureProcess {
            foreign: vec![
                Document::from_json(&json!({"_id": "root", "children": ["l", "r"]})),
                Document::from_json(&json!({"_id": "l"})),
                Document::from_json(&json!({"_id": "r"})),
            ],
        });
        let ctx = ctx_with(process);
        let spec = json!({
            "from": "tree",
            "startWith": "$start",
            "connectFromField": "children",
            "connectToField": "_id",
            "as": "subtree"
        });
        let out = run_one(&ctx, spec, json!({"start": "root"}));
        assert_eq!(out.get_value("subtree").as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_restrict_search_with_match() {
        let process = Arc::new(FixtureProcess {
            foreign: vec![
                Document::from_json(&json!({"_id": "lead", "active": true})),
                Document::from_json(&json!({"_id": "boss", "active": false})),
            ],
        });
        let ctx = ctx_with(process);
        let mut spec = graph_spec();
        spec["restrictSearchWithMatch"] = json!({"active": true});
        let out = run_one(&ctx, spec, json!({"reportsTo": "lead"}));
        assert_eq!(out.get_value("chain").as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_ceiling_is_fatal() {
        let process = Arc::new(FixtureProcess {
            foreign: (0..50)
                .map(|i| {
                    Document::from_json(&json!({
                        "_id": i,
                        "next": (i + 1) % 50,
                        "padding": "x".repeat(64)
                    }))
                })
                .collect(),
        });
        let ctx = Arc::new(
            ExpressionContext::new(Namespace::new("test", "graph"))
                .with_process_interface(process)
                .with_options({
                    let mut o = PipelineOptions::default();
                    o.max_graph_lookup_memory_bytes = 512;
                    o
                }),
        );
        let spec = json!({
            "from": "graph",
            "startWith": "$start",
            "connectFromField": "next",
            "connectToField": "_id",
            "as": "reached"
        });
        let mut queue = QueueStage::with_documents(
            ctx.clone(),
            vec![Document::from_json(&json!({"start": 0}))],
        );
        let mut stage = parse(&spec, &ctx).unwrap();
        let mut src = PullFrom(&mut queue);
        let err = stage.get_next(&mut src).unwrap_err();
        assert!(matches!(err, PipeLiteError::MemoryLimitExceeded(_)));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let ctx = ctx_with(reports_chain());
        let mut spec = graph_spec();
        spec["maxDepth"] = json!(3);
        spec["depthField"] = json!("d");
        let stage = parse(&spec, &ctx).unwrap();
        let serialized = stage.serialize(false);
        let reparsed = parse(&serialized["$graphLookup"], &ctx).unwrap();
        assert_eq!(reparsed.serialize(false), serialized);
    }
}
