// pipelite-core/src/pipeline.rs
// The pipeline container: parsing, stitching, optimization, split
//
// A pipeline owns an ordered sequence of stages. Stages never hold an
// owning pointer to their predecessor; iteration threads a chain
// handle through the sequence at call time, and `stitch` re-blesses
// the container after every structural mutation.

use crate::context::ExpressionContext;
use crate::document::Document;
use crate::error::{PipeLiteError, Result};
use crate::lite_parse::LiteParsedPipeline;
use crate::matcher::MatchExpression;
use crate::stage::group::GroupStage;
use crate::stage::match_stage::MatchStage;
use crate::stage::sort::SortStage;
use crate::stage::{
    stage_descriptor, stage_name_and_spec, DocumentSource, GetNextResult, ModifiedPaths,
    Source, StageSplit,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Whether this pipeline has been partitioned for distributed
/// execution. Splitting is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitState {
    Unsplit,
    SplitForShards,
    SplitForMerge,
}

pub struct Pipeline {
    stages: Vec<Box<dyn DocumentSource>>,
    ctx: Arc<ExpressionContext>,
    split_state: SplitState,
    stitched: bool,
    disposed: bool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

/// The predecessor handle threaded through the stage sequence: stage
/// N pulls from the chain of stages 0..N.
struct ChainSource<'a> {
    stages: &'a mut [Box<dyn DocumentSource>],
}

impl Source for ChainSource<'_> {
    fn pull(&mut self) -> Result<GetNextResult> {
        match self.stages.split_last_mut() {
            None => Ok(GetNextResult::Eof),
            Some((last, rest)) => {
                let mut source = ChainSource { stages: rest };
                last.get_next(&mut source)
            }
        }
    }
}

impl Pipeline {
    /// Full parse: lite-validate, build every stage through the
    /// registry, enforce placement rules, stitch.
    pub fn parse(raw_stages: &[serde_json::Value], ctx: Arc<ExpressionContext>) -> Result<Pipeline> {
        LiteParsedPipeline::parse(raw_stages)?;

        let mut stages = Vec::with_capacity(raw_stages.len());
        for raw in raw_stages {
            let (name, spec) = stage_name_and_spec(raw)?;
            let descriptor = stage_descriptor(name)?;
            stages.push((descriptor.parser)(spec, &ctx)?);
        }

        for (idx, stage) in stages.iter().enumerate() {
            if stage.constraints().is_initial_source && idx != 0 {
                return Err(PipeLiteError::InvalidPipeline(format!(
                    "{} is only valid as the first stage in a pipeline",
                    stage.source_name()
                )));
            }
        }
        // A collectionless namespace has no documents to scan; the
        // pipeline must produce its own input
        if ctx.namespace.coll.is_empty() {
            let ok = stages
                .first()
                .map(|s| s.constraints().is_initial_source)
                .unwrap_or(false);
            if !ok {
                return Err(PipeLiteError::InvalidPipeline(
                    "a collectionless pipeline must start with an initial source stage".into(),
                ));
            }
        }

        let mut pipeline = Pipeline {
            stages,
            ctx,
            split_state: SplitState::Unsplit,
            stitched: false,
            disposed: false,
        };
        pipeline.stitch();
        Ok(pipeline)
    }

    pub fn from_stages(
        stages: Vec<Box<dyn DocumentSource>>,
        ctx: Arc<ExpressionContext>,
    ) -> Pipeline {
        let mut pipeline = Pipeline {
            stages,
            ctx,
            split_state: SplitState::Unsplit,
            stitched: false,
            disposed: false,
        };
        pipeline.stitch();
        pipeline
    }

    pub fn context(&self) -> &Arc<ExpressionContext> {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn split_state(&self) -> SplitState {
        self.split_state
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.source_name()).collect()
    }

    /// Attach the document producer (cursor or queue) at the front.
    pub fn add_initial_source(&mut self, stage: Box<dyn DocumentSource>) {
        self.stitched = false;
        self.stages.insert(0, stage);
        self.stitch();
    }

    pub fn push_back(&mut self, stage: Box<dyn DocumentSource>) {
        self.stitched = false;
        self.stages.push(stage);
        self.stitch();
    }

    pub fn pop_front(&mut self) -> Option<Box<dyn DocumentSource>> {
        self.stitched = false;
        let stage = if self.stages.is_empty() {
            None
        } else {
            Some(self.stages.remove(0))
        };
        self.stitch();
        stage
    }

    /// Re-link the chain after structural mutation. Iteration without
    /// a stitch is a logic error.
    pub fn stitch(&mut self) {
        self.stitched = true;
    }

    /// Pull one result through the whole chain.
    pub fn get_next(&mut self) -> Result<GetNextResult> {
        debug_assert!(self.stitched, "pipeline iterated without stitch()");
        let mut chain = ChainSource {
            stages: &mut self.stages[..],
        };
        chain.pull()
    }

    /// Drain to completion, retrying through pauses.
    pub fn run(&mut self) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        loop {
            match self.get_next() {
                Ok(GetNextResult::Advanced(doc)) => out.push(doc),
                Ok(GetNextResult::Paused) => continue,
                Ok(GetNextResult::Eof) => return Ok(out),
                Err(e) => {
                    // Error unwinding must still release stage state
                    self.dispose();
                    return Err(e);
                }
            }
        }
    }

    /// Release every stage's resources, back to front. Safe to call
    /// repeatedly and during error unwinding.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        // Make sure the chain is consistent even when disposing via an
        // error path that interrupted a structural mutation
        self.stitch();
        for stage in self.stages.iter_mut().rev() {
            stage.dispose();
        }
        self.disposed = true;
    }

    pub fn serialize(&self) -> Vec<serde_json::Value> {
        self.stages.iter().map(|s| s.serialize(false)).collect()
    }

    pub fn serialize_explain(&self) -> Vec<serde_json::Value> {
        self.stages.iter().map(|s| s.serialize(true)).collect()
    }

    // ------------------------------------------------------------------
    // Optimization
    // ------------------------------------------------------------------

    /// Fixed-point local-rewrite pass: predicate pushdown, adjacent
    /// stage absorption, then per-stage optimization. Re-running past
    /// the fixed point is a no-op.
    pub fn optimize(&mut self) {
        self.stitched = false;
        loop {
            let mut changed = self.push_matches_forward();
            changed |= self.absorb_adjacent_pairs();
            if !changed {
                break;
            }
        }
        self.enable_streaming_groups();
        for stage in &mut self.stages {
            stage.optimize();
        }
        self.stitch();
    }

    /// Walk each $match backward past swap-compatible stages,
    /// splitting it when only part of the predicate is independent of
    /// the stage's modified paths.
    fn push_matches_forward(&mut self) -> bool {
        let mut changed = false;
        let mut i = 1;
        while i < self.stages.len() {
            let is_match = self.stages[i].as_any().is::<MatchStage>();
            let prev_is_match = self.stages[i - 1].as_any().is::<MatchStage>();
            if !is_match || prev_is_match || !self.stages[i - 1].can_swap_with_match() {
                i += 1;
                continue;
            }
            let modified = self.stages[i - 1].modified_paths();
            if matches!(modified, ModifiedPaths::NotSupported | ModifiedPaths::AllPaths) {
                i += 1;
                continue;
            }

            let match_stage = self.stages.remove(i);
            let match_stage = match_stage
                .as_any()
                .downcast_ref::<MatchStage>()
                .expect("checked downcast")
                .expression()
                .clone();
            let (pushable, residual) = split_match_expression(match_stage, &modified);

            let mut advanced = false;
            if let Some(residual) = residual {
                self.stages.insert(
                    i,
                    Box::new(MatchStage::from_expression(self.ctx.clone(), residual)),
                );
            }
            if let Some(pushable) = pushable {
                self.stages.insert(
                    i - 1,
                    Box::new(MatchStage::from_expression(self.ctx.clone(), pushable)),
                );
                changed = true;
                advanced = true;
            }
            if !advanced {
                // Nothing moved; the reinserted residual is the
                // original match
                i += 1;
            }
        }
        changed
    }

    /// Offer each stage its successor for fusion ($sort+$limit,
    /// $lookup+$unwind, $match+$match, $limit+$limit, $skip+$skip).
    fn absorb_adjacent_pairs(&mut self) -> bool {
        let mut changed = false;
        let mut i = 0;
        while i + 1 < self.stages.len() {
            let next = self.stages.remove(i + 1);
            match self.stages[i].try_absorb(next) {
                Ok(()) => {
                    changed = true;
                    // Stay: the new successor may fuse as well
                }
                Err(next) => {
                    self.stages.insert(i + 1, next);
                    i += 1;
                }
            }
        }
        changed
    }

    /// A $group directly following a $sort whose leading sort fields
    /// are exactly the group's id field paths can stream, emitting
    /// each group at its key-change boundary.
    fn enable_streaming_groups(&mut self) {
        for i in 1..self.stages.len() {
            let Some(sort_fields) = self.stages[i - 1]
                .as_any()
                .downcast_ref::<SortStage>()
                .map(|s| {
                    s.pattern()
                        .iter()
                        .map(|(f, _)| f.clone())
                        .collect::<Vec<_>>()
                })
            else {
                continue;
            };
            let Some(group) = self.stages[i].as_any_mut().downcast_mut::<GroupStage>() else {
                continue;
            };
            if group.is_streaming() {
                continue;
            }
            let Some(id_paths) = group.id_field_paths() else {
                continue;
            };
            if id_paths.is_empty() || id_paths.len() > sort_fields.len() {
                continue;
            }
            let prefix: BTreeSet<&str> =
                sort_fields[..id_paths.len()].iter().map(String::as_str).collect();
            let ids: BTreeSet<&str> = id_paths.iter().map(String::as_str).collect();
            if prefix == ids {
                group.enable_streaming();
            }
        }
    }

    // ------------------------------------------------------------------
    // Distributed split
    // ------------------------------------------------------------------

    /// Partition for distributed execution: everything before the
    /// first merge-side-only stage runs on the shards; that stage's
    /// shard/merge halves bridge the cut, and all later stages move to
    /// the merge side. The receiver becomes the merge pipeline and the
    /// returned pipeline is the shard half. Irreversible.
    pub fn split_for_sharded(&mut self) -> Result<Pipeline> {
        if self.split_state != SplitState::Unsplit {
            return Err(PipeLiteError::InvalidPipeline(
                "pipeline is already split".into(),
            ));
        }
        self.stitched = false;

        let mut shard_stages: Vec<Box<dyn DocumentSource>> = Vec::new();
        let mut merge_stages: Vec<Box<dyn DocumentSource>> = Vec::new();
        let mut split_found = false;
        for stage in std::mem::take(&mut self.stages) {
            if split_found {
                merge_stages.push(stage);
                continue;
            }
            match stage.split_for_distribution() {
                StageSplit::Shard(stage) => shard_stages.push(stage),
                StageSplit::SplitPoint { shard, merge } => {
                    if let Some(shard) = shard {
                        shard_stages.push(shard);
                    }
                    merge_stages.push(merge);
                    split_found = true;
                }
            }
        }

        self.stages = merge_stages;
        self.split_state = SplitState::SplitForMerge;
        self.stitch();

        let mut shard_half = Pipeline {
            stages: shard_stages,
            ctx: self.ctx.clone(),
            split_state: SplitState::SplitForShards,
            stitched: false,
            disposed: false,
        };
        shard_half.stitch();
        Ok(shard_half)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Partition a predicate's top-level conjuncts into (independent of
/// the modified paths, dependent).
fn split_match_expression(
    expr: MatchExpression,
    modified: &ModifiedPaths,
) -> (Option<MatchExpression>, Option<MatchExpression>) {
    let conjuncts = match expr {
        MatchExpression::And(children) => children,
        other => vec![other],
    };
    let mut pushable = Vec::new();
    let mut residual = Vec::new();
    for conjunct in conjuncts {
        let mut deps = BTreeSet::new();
        conjunct.add_dependencies(&mut deps);
        if modified.intersects(&deps) {
            residual.push(conjunct);
        } else {
            pushable.push(conjunct);
        }
    }
    let rebuild = |mut parts: Vec<MatchExpression>| match parts.len() {
        0 => None,
        1 => Some(parts.pop().unwrap()),
        _ => Some(MatchExpression::And(parts)),
    };
    (rebuild(pushable), rebuild(residual))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Namespace;
    use crate::stage::source::QueueStage;
    use serde_json::json;

    fn ctx() -> Arc<ExpressionContext> {
        Arc::new(ExpressionContext::new(Namespace::new("test", "coll")))
    }

    fn docs(items: Vec<serde_json::Value>) -> Vec<Document> {
        items.iter().map(Document::from_json).collect()
    }

    fn pipeline_with_input(
        ctx: &Arc<ExpressionContext>,
        stages: serde_json::Value,
        input: Vec<serde_json::Value>,
    ) -> Pipeline {
        let raw: Vec<serde_json::Value> = stages.as_array().unwrap().clone();
        let mut pipeline = Pipeline::parse(&raw, ctx.clone()).unwrap();
        pipeline.add_initial_source(Box::new(QueueStage::with_documents(
            ctx.clone(),
            docs(input),
        )));
        pipeline
    }

    #[test]
    fn test_parse_unknown_stage() {
        let err = Pipeline::parse(&[json!({"$frob": 1})], ctx()).unwrap_err();
        assert!(matches!(err, PipeLiteError::UnknownStage(_)));
    }

    #[test]
    fn test_initial_source_must_be_first() {
        let err = Pipeline::parse(
            &[json!({"$match": {}}), json!({"$collStats": {}})],
            ctx(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("first stage"));
    }

    #[test]
    fn test_collectionless_requires_initial_source() {
        let ctx = Arc::new(ExpressionContext::new(Namespace::new("admin", "")));
        let err = Pipeline::parse(&[json!({"$match": {}})], ctx).unwrap_err();
        assert!(matches!(err, PipeLiteError::InvalidPipeline(_)));
    }

    #[test]
    fn test_end_to_end_match_group_sort() {
        let ctx = ctx();
        let mut pipeline = pipeline_with_input(
            &ctx,
            json!([
                {"$match": {"age": {"$gte": 25}}},
                {"$group": {"_id": "$city", "count": {"$sum": 1}, "avgAge": {"$avg": "$age"}}},
                {"$sort": {"count": -1}}
            ]),
            vec![
                json!({"name": "Alice", "age": 25, "city": "NYC"}),
                json!({"name": "Bob", "age": 30, "city": "LA"}),
                json!({"name": "Charlie", "age": 35, "city": "NYC"}),
                json!({"name": "David", "age": 20, "city": "LA"}),
            ],
        );
        let results = pipeline.run().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].get_value("_id"), crate::value::Value::string("NYC"));
        assert_eq!(results[0].get_value("count"), crate::value::Value::Int64(2));
    }

    #[test]
    fn test_match_pushdown_before_project() {
        let ctx = ctx();
        let raw = vec![
            json!({"$addFields": {"computed": {"$add": ["$a", 1]}}}),
            json!({"$match": {"b": 5}}),
        ];
        let mut pipeline = Pipeline::parse(&raw, ctx).unwrap();
        pipeline.optimize();
        // The match reads only 'b', which $addFields leaves alone
        assert_eq!(pipeline.stage_names(), vec!["$match", "$addFields"]);
    }

    #[test]
    fn test_match_split_on_partial_overlap() {
        let ctx = ctx();
        let raw = vec![
            json!({"$addFields": {"computed": {"$add": ["$a", 1]}}}),
            json!({"$match": {"computed": {"$gt": 0}, "b": 5}}),
        ];
        let mut pipeline = Pipeline::parse(&raw, ctx).unwrap();
        pipeline.optimize();
        // Split: the 'b' half pushes ahead, the 'computed' half stays
        assert_eq!(
            pipeline.stage_names(),
            vec!["$match", "$addFields", "$match"]
        );
        let serialized = pipeline.serialize();
        assert_eq!(serialized[0], json!({"$match": {"b": {"$eq": 5}}}));
        assert_eq!(serialized[2], json!({"$match": {"computed": {"$gt": 0}}}));
    }

    #[test]
    fn test_match_does_not_push_past_group() {
        let ctx = ctx();
        let raw = vec![
            json!({"$group": {"_id": "$a", "n": {"$sum": 1}}}),
            json!({"$match": {"n": {"$gt": 1}}}),
        ];
        let mut pipeline = Pipeline::parse(&raw, ctx).unwrap();
        pipeline.optimize();
        assert_eq!(pipeline.stage_names(), vec!["$group", "$match"]);
    }

    #[test]
    fn test_sort_absorbs_limit() {
        let ctx = ctx();
        let raw = vec![json!({"$sort": {"a": 1}}), json!({"$limit": 3})];
        let mut pipeline = Pipeline::parse(&raw, ctx).unwrap();
        pipeline.optimize();
        assert_eq!(pipeline.stage_names(), vec!["$sort"]);
    }

    #[test]
    fn test_adjacent_matches_merge() {
        let ctx = ctx();
        let raw = vec![json!({"$match": {"a": 1}}), json!({"$match": {"b": 2}})];
        let mut pipeline = Pipeline::parse(&raw, ctx).unwrap();
        pipeline.optimize();
        assert_eq!(pipeline.stage_names(), vec!["$match"]);
    }

    #[test]
    fn test_limits_and_skips_coalesce() {
        let ctx = ctx();
        let raw = vec![
            json!({"$skip": 2}),
            json!({"$skip": 3}),
            json!({"$limit": 10}),
            json!({"$limit": 4}),
        ];
        let mut pipeline = Pipeline::parse(&raw, ctx).unwrap();
        pipeline.optimize();
        assert_eq!(pipeline.stage_names(), vec!["$skip", "$limit"]);
        let serialized = pipeline.serialize();
        assert_eq!(serialized[0], json!({"$skip": 5}));
        assert_eq!(serialized[1], json!({"$limit": 4}));
    }

    #[test]
    fn test_optimize_is_convergent() {
        let ctx = ctx();
        let raw = vec![
            json!({"$addFields": {"c": {"$add": ["$a", 1]}}}),
            json!({"$match": {"b": 5, "c": {"$gt": 0}}}),
            json!({"$sort": {"b": 1}}),
            json!({"$limit": 7}),
        ];
        let mut pipeline = Pipeline::parse(&raw, ctx).unwrap();
        pipeline.optimize();
        let once = pipeline.serialize();
        pipeline.optimize();
        let twice = pipeline.serialize();
        assert_eq!(once, twice, "optimizer must be a no-op past its fixed point");
    }

    #[test]
    fn test_streaming_group_enabled_after_sort() {
        let ctx = ctx();
        let raw = vec![
            json!({"$sort": {"k": 1}}),
            json!({"$group": {"_id": "$k", "n": {"$sum": 1}}}),
        ];
        let mut pipeline = Pipeline::parse(&raw, ctx).unwrap();
        pipeline.optimize();
        // Find the group stage and confirm streaming mode
        let streaming = pipeline
            .stages
            .iter()
            .filter_map(|s| s.as_any().downcast_ref::<GroupStage>())
            .any(|g| g.is_streaming());
        assert!(streaming);
    }

    #[test]
    fn test_serialize_reparse_same_output() {
        let ctx = ctx();
        let raw = vec![
            json!({"$match": {"a": {"$gt": 1}}}),
            json!({"$group": {"_id": "$a", "total": {"$sum": 1}}}),
            json!({"$project": {"total": 1, "_id": 0}}),
        ];
        let input = vec![
            json!({"a": 1}),
            json!({"a": 2}),
            json!({"a": 2}),
            json!({"a": 3}),
        ];

        let mut first = pipeline_with_input(&ctx, json!(raw), input.clone());
        let reserialized: Vec<serde_json::Value> = {
            let parsed = Pipeline::parse(&raw, ctx.clone()).unwrap();
            parsed.serialize()
        };
        let mut second = pipeline_with_input(
            &ctx,
            serde_json::Value::Array(reserialized),
            input,
        );

        let sort_key = |d: &Document| d.to_json().to_string();
        let mut a: Vec<String> = first.run().unwrap().iter().map(sort_key).collect();
        let mut b: Vec<String> = second.run().unwrap().iter().map(sort_key).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_split_for_sharded_group() {
        let ctx = ctx();
        let raw = vec![
            json!({"$match": {"a": {"$gte": 0}}}),
            json!({"$group": {"_id": "$a", "n": {"$sum": 1}}}),
            json!({"$sort": {"n": -1}}),
        ];
        let mut pipeline = Pipeline::parse(&raw, ctx).unwrap();
        let shard_half = pipeline.split_for_sharded().unwrap();

        assert_eq!(shard_half.split_state(), SplitState::SplitForShards);
        assert_eq!(pipeline.split_state(), SplitState::SplitForMerge);
        // Shards: match + partial group; merge: merging group + sort
        assert_eq!(shard_half.stage_names(), vec!["$match", "$group"]);
        assert_eq!(pipeline.stage_names(), vec!["$group", "$sort"]);

        // Splitting twice is an error
        assert!(pipeline.split_for_sharded().is_err());
    }

    #[test]
    fn test_split_executes_correctly() {
        let ctx = ctx();
        let raw = vec![json!({"$group": {"_id": "$k", "total": {"$sum": "$v"}}})];
        let mut merge_half = Pipeline::parse(&raw, ctx.clone()).unwrap();
        let first_shard = merge_half.split_for_sharded().unwrap();
        let second_shard = {
            let mut fresh = Pipeline::parse(&raw, ctx.clone()).unwrap();
            fresh.split_for_sharded().unwrap()
        };

        // Drive each shard half over its own data, then feed the
        // partials into the merge half
        let shard_inputs = vec![
            vec![json!({"k": 1, "v": 10}), json!({"k": 1, "v": 5})],
            vec![json!({"k": 1, "v": 1}), json!({"k": 2, "v": 2})],
        ];
        let mut partials = Vec::new();
        for (input, mut shard) in shard_inputs.into_iter().zip([first_shard, second_shard]) {
            shard.add_initial_source(Box::new(QueueStage::with_documents(
                ctx.clone(),
                docs(input),
            )));
            partials.extend(shard.run().unwrap());
        }

        merge_half.add_initial_source(Box::new(QueueStage::with_documents(
            ctx.clone(),
            partials,
        )));
        let results = merge_half.run().unwrap();
        assert_eq!(results.len(), 2);
        let one = results
            .iter()
            .find(|d| d.get_value("_id") == crate::value::Value::Int64(1))
            .unwrap();
        assert_eq!(one.get_value("total"), crate::value::Value::Int64(16));
    }

    #[test]
    fn test_pause_propagation_through_passthrough_chain() {
        let ctx = ctx();
        let doc = Document::from_json(&json!({"a": 1}));
        let events = vec![
            GetNextResult::Advanced(doc.clone()),
            GetNextResult::Paused,
            GetNextResult::Advanced(doc.clone()),
            GetNextResult::Paused,
            GetNextResult::Eof,
        ];
        let raw = vec![json!({"$addFields": {"b": {"$add": ["$a", 1]}}})];
        let mut pipeline = Pipeline::parse(&raw, ctx.clone()).unwrap();
        pipeline.add_initial_source(Box::new(QueueStage::with_results(ctx, events)));

        assert!(pipeline.get_next().unwrap().is_advanced());
        assert!(pipeline.get_next().unwrap().is_paused());
        assert!(pipeline.get_next().unwrap().is_advanced());
        assert!(pipeline.get_next().unwrap().is_paused());
        assert!(pipeline.get_next().unwrap().is_eof());
    }

    #[test]
    fn test_interrupt_unwinds_pipeline() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        let ctx = Arc::new(
            ExpressionContext::new(Namespace::new("test", "coll"))
                .with_interrupt(Arc::new(move || flag2.load(Ordering::Relaxed))),
        );
        let mut pipeline = Pipeline::parse(&[json!({"$match": {}})], ctx.clone()).unwrap();
        pipeline.add_initial_source(Box::new(QueueStage::with_documents(
            ctx,
            docs(vec![json!({"a": 1}), json!({"a": 2})]),
        )));

        assert!(pipeline.get_next().unwrap().is_advanced());
        flag.store(true, Ordering::Relaxed);
        let err = pipeline.get_next().unwrap_err();
        assert!(matches!(err, PipeLiteError::Interrupted));
    }

    #[test]
    fn test_dispose_idempotent() {
        let ctx = ctx();
        let mut pipeline = pipeline_with_input(
            &ctx,
            json!([{"$match": {}}]),
            vec![json!({"a": 1})],
        );
        pipeline.dispose();
        pipeline.dispose();
        assert!(pipeline.get_next().unwrap().is_eof());
    }
}
