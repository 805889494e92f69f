// pipelite-core/src/stage/limit_skip.rs
// $limit and $skip: trivial streaming stages

use crate::context::ExpressionContext;
use crate::error::{PipeLiteError, Result};
use crate::stage::{
    DocumentSource, GetNextResult, ModifiedPaths, Source, StageConstraints, StageSplit,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

// ============================================================================
// $limit
// ============================================================================

pub struct LimitStage {
    ctx: Arc<ExpressionContext>,
    limit: u64,
    returned: u64,
    disposed: bool,
}

pub fn parse_limit(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    let limit = spec.as_u64().filter(|n| *n > 0).ok_or_else(|| {
        PipeLiteError::InvalidPipeline("the limit must be a positive number".to_string())
    })?;
    Ok(Box::new(LimitStage::new(ctx.clone(), limit)))
}

impl LimitStage {
    pub fn new(ctx: Arc<ExpressionContext>, limit: u64) -> LimitStage {
        LimitStage {
            ctx,
            limit,
            returned: 0,
            disposed: false,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl DocumentSource for LimitStage {
    fn source_name(&self) -> &'static str {
        "$limit"
    }

    fn get_next(&mut self, source: &mut dyn Source) -> Result<GetNextResult> {
        if self.disposed || self.returned >= self.limit {
            return Ok(GetNextResult::Eof);
        }
        self.ctx.check_interrupted()?;
        let result = source.pull()?;
        if result.is_advanced() {
            self.returned += 1;
        }
        Ok(result)
    }

    fn constraints(&self) -> StageConstraints {
        StageConstraints::streaming()
    }

    fn modified_paths(&self) -> ModifiedPaths {
        ModifiedPaths::FiniteSet(BTreeSet::new())
    }

    fn serialize(&self, _explain: bool) -> serde_json::Value {
        json!({ "$limit": self.limit })
    }

    fn try_absorb(
        &mut self,
        next: Box<dyn DocumentSource>,
    ) -> std::result::Result<(), Box<dyn DocumentSource>> {
        // limit(a) then limit(b) is limit(min(a, b))
        if let Some(other) = next.as_any().downcast_ref::<LimitStage>() {
            self.limit = self.limit.min(other.limit);
            return Ok(());
        }
        Err(next)
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }

    fn split_for_distribution(self: Box<Self>) -> StageSplit {
        // Each shard can cut early, but the merge side must cut again
        let shard = Box::new(LimitStage::new(self.ctx.clone(), self.limit));
        StageSplit::SplitPoint {
            shard: Some(shard),
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

// ============================================================================
// $skip
// ============================================================================

pub struct SkipStage {
    ctx: Arc<ExpressionContext>,
    skip: u64,
    skipped: u64,
    disposed: bool,
}

pub fn parse_skip(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    let skip = spec.as_u64().ok_or_else(|| {
        PipeLiteError::InvalidPipeline("the skip must be a non-negative number".to_string())
    })?;
    Ok(Box::new(SkipStage {
        ctx: ctx.clone(),
        skip,
        skipped: 0,
        disposed: false,
    }))
}

impl SkipStage {
    pub fn skip(&self) -> u64 {
        self.skip
    }
}

impl DocumentSource for SkipStage {
    fn source_name(&self) -> &'static str {
        "$skip"
    }

    fn get_next(&mut self, source: &mut dyn Source) -> Result<GetNextResult> {
        if self.disposed {
            return Ok(GetNextResult::Eof);
        }
        loop {
            self.ctx.check_interrupted()?;
            let result = source.pull()?;
            match result {
                GetNextResult::Advanced(_) if self.skipped < self.skip => {
                    self.skipped += 1;
                }
                other => return Ok(other),
            }
        }
    }

    fn constraints(&self) -> StageConstraints {
        StageConstraints::streaming()
    }

    fn modified_paths(&self) -> ModifiedPaths {
        ModifiedPaths::FiniteSet(BTreeSet::new())
    }

    fn serialize(&self, _explain: bool) -> serde_json::Value {
        json!({ "$skip": self.skip })
    }

    fn try_absorb(
        &mut self,
        next: Box<dyn DocumentSource>,
    ) -> std::result::Result<(), Box<dyn DocumentSource>> {
        // skip(a) then skip(b) is skip(a + b)
        if let Some(other) = next.as_any().downcast_ref::<SkipStage>() {
            self.skip = self.skip.saturating_add(other.skip);
            return Ok(());
        }
        Err(next)
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }

    fn split_for_distribution(self: Box<Self>) -> StageSplit {
        // Skipping must see the merged stream; shards send everything
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
