// pipelite-core/src/stage.rs
// The DocumentSource abstraction: pull-based stages with constraints
//
// Every pipeline stage implements [`DocumentSource`]. Stages never own
// their predecessor; the pipeline passes a [`Source`] handle into each
// `get_next` call, so restructuring during optimization can't leave
// dangling links.

pub mod graph_lookup;
pub mod group;
pub mod limit_skip;
pub mod lookup;
pub mod match_stage;
pub mod project;
pub mod redact;
pub mod sample;
pub mod sort;
pub mod source;
pub mod unwind;

use crate::context::ExpressionContext;
use crate::document::Document;
use crate::error::{PipeLiteError, Result};
use lazy_static::lazy_static;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Three-valued pull status.
///
/// `Paused` is a cooperative "no data yet, ask again" handshake, not
/// an end of stream; stages that don't buffer multiple inputs must
/// propagate it unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum GetNextResult {
    Advanced(Document),
    Paused,
    Eof,
}

impl GetNextResult {
    pub fn is_advanced(&self) -> bool {
        matches!(self, GetNextResult::Advanced(_))
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, GetNextResult::Paused)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, GetNextResult::Eof)
    }

    pub fn document(self) -> Option<Document> {
        match self {
            GetNextResult::Advanced(doc) => Some(doc),
            _ => None,
        }
    }
}

/// Handle to a stage's predecessor, provided by the pipeline at call
/// time.
pub trait Source {
    fn pull(&mut self) -> Result<GetNextResult>;
}

/// The predecessor of an initial stage: always end-of-stream.
pub struct NoSource;

impl Source for NoSource {
    fn pull(&mut self) -> Result<GetNextResult> {
        Ok(GetNextResult::Eof)
    }
}

/// Streaming stages emit before consuming all input; blocking stages
/// must drain their source first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Streaming,
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionRequirement {
    None,
    First,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTypeRequirement {
    None,
    AnyShard,
    PrimaryShard,
    LocalOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskUseRequirement {
    NoDiskUse,
    WritesTmpData,
}

/// Static per-stage facts consumed by the optimizer, placement
/// validation and distributed split logic.
#[derive(Debug, Clone, Copy)]
pub struct StageConstraints {
    pub stream_type: StreamType,
    pub required_position: PositionRequirement,
    pub host_requirement: HostTypeRequirement,
    pub disk_requirement: DiskUseRequirement,
    /// Valid with no predecessor (materializes its own input)
    pub is_initial_source: bool,
}

impl StageConstraints {
    pub fn streaming() -> StageConstraints {
        StageConstraints {
            stream_type: StreamType::Streaming,
            required_position: PositionRequirement::None,
            host_requirement: HostTypeRequirement::None,
            disk_requirement: DiskUseRequirement::NoDiskUse,
            is_initial_source: false,
        }
    }

    pub fn blocking() -> StageConstraints {
        StageConstraints {
            stream_type: StreamType::Blocking,
            required_position: PositionRequirement::None,
            host_requirement: HostTypeRequirement::None,
            disk_requirement: DiskUseRequirement::WritesTmpData,
            is_initial_source: false,
        }
    }

    pub fn initial_source() -> StageConstraints {
        StageConstraints {
            stream_type: StreamType::Streaming,
            required_position: PositionRequirement::First,
            host_requirement: HostTypeRequirement::None,
            disk_requirement: DiskUseRequirement::NoDiskUse,
            is_initial_source: true,
        }
    }
}

/// What a stage does to document paths, used to decide whether a
/// $match on an unrelated path can be pushed in front of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifiedPaths {
    /// The stage can't describe its effects; assume the worst
    NotSupported,
    AllPaths,
    FiniteSet(BTreeSet<String>),
    /// Everything except these paths is modified ($project inclusion)
    AllExcept(BTreeSet<String>),
}

impl ModifiedPaths {
    /// Would a predicate reading `paths` see different values after
    /// this stage ran? Conservative: unknown means yes.
    pub fn intersects(&self, paths: &BTreeSet<String>) -> bool {
        let related = |a: &str, b: &str| {
            a == b
                || a.starts_with(&format!("{}.", b))
                || b.starts_with(&format!("{}.", a))
        };
        match self {
            ModifiedPaths::NotSupported | ModifiedPaths::AllPaths => true,
            ModifiedPaths::FiniteSet(modified) => paths
                .iter()
                .any(|p| p.is_empty() || modified.iter().any(|m| related(p, m))),
            ModifiedPaths::AllExcept(kept) => paths.iter().any(|p| {
                p.is_empty()
                    || !kept
                        .iter()
                        .any(|k| p == k || p.starts_with(&format!("{}.", k)))
            }),
        }
    }
}

/// Shard/merge decomposition of one stage when a pipeline splits for
/// distributed execution.
pub enum StageSplit {
    /// Runs unchanged on every shard; the split point is later
    Shard(Box<dyn DocumentSource>),
    /// The pipeline splits at this stage
    SplitPoint {
        shard: Option<Box<dyn DocumentSource>>,
        merge: Box<dyn DocumentSource>,
    },
}

/// One pipeline stage.
pub trait DocumentSource: Send {
    /// Immutable stage identity, e.g. `"$match"`.
    fn source_name(&self) -> &'static str;

    /// Pull the next result, drawing input from `source`.
    ///
    /// Implementations call `ExpressionContext::check_interrupted` at
    /// least once per produced result.
    fn get_next(&mut self, source: &mut dyn Source) -> Result<GetNextResult>;

    fn constraints(&self) -> StageConstraints;

    fn modified_paths(&self) -> ModifiedPaths {
        ModifiedPaths::NotSupported
    }

    /// Whether a following $match on unmodified paths may move in
    /// front of this stage. Requires an honest `modified_paths`.
    fn can_swap_with_match(&self) -> bool {
        false
    }

    /// Add the field paths this stage reads to `deps`.
    fn dependencies(&self, _deps: &mut BTreeSet<String>) {}

    /// Serialize back to `{"$name": spec}`; `explain` adds diagnostic
    /// fields.
    fn serialize(&self, explain: bool) -> serde_json::Value;

    /// Stage-local optimization (e.g. optimize the match tree).
    fn optimize(&mut self) {}

    /// Offer the following stage for fusion. Return `Ok(())` after
    /// absorbing it, or give it back unchanged.
    fn try_absorb(
        &mut self,
        next: Box<dyn DocumentSource>,
    ) -> std::result::Result<(), Box<dyn DocumentSource>> {
        Err(next)
    }

    /// Release resources. Idempotent; callable from any state
    /// (including mid-unwind), after which `get_next` returns `Eof`.
    fn dispose(&mut self);

    /// Decompose for distributed execution.
    fn split_for_distribution(self: Box<Self>) -> StageSplit;

    /// Downcast support for optimizer rewrites.
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

impl std::fmt::Debug for dyn DocumentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(self.source_name()).finish_non_exhaustive()
    }
}

/// Parser signature stored in the stage registry.
pub type StageParserFn =
    fn(&serde_json::Value, &Arc<ExpressionContext>) -> Result<Box<dyn DocumentSource>>;

/// Registry row: the parser plus the placement facts lite-parsing
/// needs before any stage object exists.
#[derive(Debug)]
pub struct StageDescriptor {
    pub parser: StageParserFn,
    /// Must be the first stage if present
    pub initial_only: bool,
}

lazy_static! {
    /// Stage-name -> descriptor, populated once at startup. A name can
    /// only appear once in this literal table; the debug assertion
    /// keeps future edits honest.
    pub static ref STAGE_REGISTRY: HashMap<&'static str, StageDescriptor> = {
        let mut registry: HashMap<&'static str, StageDescriptor> = HashMap::new();
        let mut add = |name: &'static str, parser: StageParserFn, initial_only: bool| {
            let previous = registry.insert(name, StageDescriptor { parser, initial_only });
            debug_assert!(previous.is_none(), "duplicate stage name: {}", name);
        };
        add("$match", match_stage::parse, false);
        add("$project", project::parse_project, false);
        add("$addFields", project::parse_add_fields, false);
        add("$group", group::parse, false);
        add("$sort", sort::parse, false);
        add("$limit", limit_skip::parse_limit, false);
        add("$skip", limit_skip::parse_skip, false);
        add("$unwind", unwind::parse, false);
        add("$sample", sample::parse, false);
        add("$lookup", lookup::parse, false);
        add("$graphLookup", graph_lookup::parse, false);
        add("$redact", redact::parse, false);
        add("$collStats", source::parse_coll_stats, true);
        registry
    };
}

/// Look up a stage descriptor; unknown names are a parse-time error.
pub fn stage_descriptor(name: &str) -> Result<&'static StageDescriptor> {
    STAGE_REGISTRY
        .get(name)
        .ok_or_else(|| PipeLiteError::UnknownStage(name.to_string()))
}

/// Split `{"$name": spec}` into its single stage name and argument.
pub fn stage_name_and_spec(
    stage: &serde_json::Value,
) -> Result<(&String, &serde_json::Value)> {
    let obj = stage.as_object().ok_or_else(|| {
        PipeLiteError::InvalidPipeline("a pipeline stage specification must be an object".into())
    })?;
    if obj.len() != 1 {
        return Err(PipeLiteError::InvalidPipeline(
            "a pipeline stage specification must contain exactly one field".into(),
        ));
    }
    Ok(obj.iter().next().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_known_names() {
        for name in [
            "$match",
            "$project",
            "$addFields",
            "$group",
            "$sort",
            "$limit",
            "$skip",
            "$unwind",
            "$sample",
            "$lookup",
            "$graphLookup",
            "$redact",
            "$collStats",
        ] {
            assert!(stage_descriptor(name).is_ok(), "missing stage {}", name);
        }
        let err = stage_descriptor("$frobnicate").unwrap_err();
        assert_eq!(err.code(), PipeLiteError::UnknownStage(String::new()).code());
    }

    #[test]
    fn test_stage_name_and_spec() {
        let ok = serde_json::json!({"$match": {"a": 1}});
        let (name, _) = stage_name_and_spec(&ok).unwrap();
        assert_eq!(name, "$match");

        assert!(stage_name_and_spec(&serde_json::json!("nope")).is_err());
        assert!(stage_name_and_spec(&serde_json::json!({"$a": 1, "$b": 2})).is_err());
    }

    #[test]
    fn test_modified_paths_intersection() {
        let finite = ModifiedPaths::FiniteSet(
            ["a".to_string(), "b.c".to_string()].into_iter().collect(),
        );
        let reads = |paths: &[&str]| -> BTreeSet<String> {
            paths.iter().map(|s| s.to_string()).collect()
        };
        assert!(finite.intersects(&reads(&["a"])));
        assert!(finite.intersects(&reads(&["a.x"])));
        assert!(finite.intersects(&reads(&["b"])));
        assert!(!finite.intersects(&reads(&["d"])));

        let except = ModifiedPaths::AllExcept(["keep".to_string()].into_iter().collect());
        assert!(!except.intersects(&reads(&["keep"])));
        assert!(!except.intersects(&reads(&["keep.sub"])));
        assert!(except.intersects(&reads(&["other"])));

        assert!(ModifiedPaths::NotSupported.intersects(&reads(&["x"])));
        assert!(ModifiedPaths::AllPaths.intersects(&reads(&["x"])));
    }
}
