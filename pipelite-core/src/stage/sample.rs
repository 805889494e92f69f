// pipelite-core/src/stage/sample.rs
// $sample: uniform random sample via a random sort key
//
// Every input document gets a uniformly random out-of-band sort key
// and the whole stream funnels through the rand-key sort with the
// sample size as its limit. When a split pipeline merges shard
// streams, the merge half keeps the keys the shards attached and
// only re-merges and cuts.

use crate::context::ExpressionContext;
use crate::document::DocumentBuilder;
use crate::error::{PipeLiteError, Result};
use crate::stage::sort::SortStage;
use crate::stage::{
    DocumentSource, GetNextResult, Source, StageConstraints, StageSplit,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;

pub struct SampleStage {
    ctx: Arc<ExpressionContext>,
    size: u64,
    /// Merge half of a split pipeline: inputs already carry rand keys
    merge_mode: bool,
    funnel: SortStage,
    rng: StdRng,
}

pub fn parse(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    let obj = spec.as_object().ok_or_else(|| {
        PipeLiteError::InvalidPipeline(
            "the $sample stage specification must be an object".into(),
        )
    })?;
    let size_value = obj
        .get("size")
        .ok_or_else(|| PipeLiteError::InvalidPipeline("$sample must specify a size".into()))?;
    let size = size_value.as_u64().ok_or_else(|| {
        PipeLiteError::InvalidPipeline(
            "size argument to $sample must be a non-negative integer".into(),
        )
    })?;
    for key in obj.keys() {
        if key != "size" {
            return Err(PipeLiteError::InvalidPipeline(format!(
                "unrecognized option to $sample: {}",
                key
            )));
        }
    }
    Ok(Box::new(SampleStage::new(ctx.clone(), size, false)))
}

impl SampleStage {
    fn new(ctx: Arc<ExpressionContext>, size: u64, merge_mode: bool) -> SampleStage {
        SampleStage {
            funnel: SortStage::by_rand_key(ctx.clone(), Some(size)),
            ctx,
            size,
            merge_mode,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Wraps the upstream source, stamping a fresh random sort key onto
/// every advanced document (unless merging pre-keyed shard streams).
struct KeyedSource<'a> {
    inner: &'a mut dyn Source,
    rng: &'a mut StdRng,
    merge_mode: bool,
}

impl Source for KeyedSource<'_> {
    fn pull(&mut self) -> Result<GetNextResult> {
        Ok(match self.inner.pull()? {
            GetNextResult::Advanced(doc) => {
                if self.merge_mode && doc.metadata().rand_sort_key.is_some() {
                    GetNextResult::Advanced(doc)
                } else {
                    let mut keyed = DocumentBuilder::from_document(&doc);
                    keyed.set_rand_sort_key(self.rng.random::<f64>());
                    GetNextResult::Advanced(keyed.freeze())
                }
            }
            other => other,
        })
    }
}

impl DocumentSource for SampleStage {
    fn source_name(&self) -> &'static str {
        "$sample"
    }

    fn get_next(&mut self, source: &mut dyn Source) -> Result<GetNextResult> {
        if self.size == 0 {
            return Ok(GetNextResult::Eof);
        }
        let mut keyed = KeyedSource {
            inner: source,
            rng: &mut self.rng,
            merge_mode: self.merge_mode,
        };
        self.funnel.get_next(&mut keyed)
    }

    fn constraints(&self) -> StageConstraints {
        StageConstraints::blocking()
    }

    fn serialize(&self, _explain: bool) -> serde_json::Value {
        json!({ "$sample": { "size": self.size } })
    }

    fn dispose(&mut self) {
        self.funnel.dispose();
        self.size = 0;
    }

    fn split_for_distribution(self: Box<Self>) -> StageSplit {
        // Shards sample locally (attaching keys); the merge half keeps
        // those keys and just merges pre-sorted-by-random-key streams
        let shard = Box::new(SampleStage::new(self.ctx.clone(), self.size, false));
        let merge = Box::new(SampleStage::new(self.ctx.clone(), self.size, true));
        StageSplit::SplitPoint {
            shard: Some(shard),
            merge,
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
