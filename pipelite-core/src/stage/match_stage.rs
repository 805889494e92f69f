// pipelite-core/src/stage/match_stage.rs
// $match: streaming predicate filter

use crate::context::ExpressionContext;
use crate::error::Result;
use crate::matcher::MatchExpression;
use crate::stage::{
    DocumentSource, GetNextResult, ModifiedPaths, Source, StageConstraints, StageSplit,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct MatchStage {
    ctx: Arc<ExpressionContext>,
    expr: MatchExpression,
    disposed: bool,
}

pub fn parse(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    let mut expr = MatchExpression::parse(spec)?;
    expr.set_collator(ctx.collator_arc());
    Ok(Box::new(MatchStage {
        ctx: ctx.clone(),
        expr,
        disposed: false,
    }))
}

impl MatchStage {
    pub fn from_expression(ctx: Arc<ExpressionContext>, mut expr: MatchExpression) -> MatchStage {
        expr.set_collator(ctx.collator_arc());
        MatchStage {
            ctx,
            expr,
            disposed: false,
        }
    }

    pub fn expression(&self) -> &MatchExpression {
        &self.expr
    }

    /// Split into (pushable, residual) around a set of modified
    /// paths; used by predicate pushdown. Consumes the stage's
    /// expression, so the caller rebuilds stages from the halves.
    pub fn split_expression(
        self,
        banned: &BTreeSet<String>,
    ) -> (Option<MatchExpression>, Option<MatchExpression>) {
        self.expr.split_by_paths(banned)
    }

    pub fn context(&self) -> &Arc<ExpressionContext> {
        &self.ctx
    }
}

impl DocumentSource for MatchStage {
    fn source_name(&self) -> &'static str {
        "$match"
    }

    fn get_next(&mut self, source: &mut dyn Source) -> Result<GetNextResult> {
        if self.disposed {
            return Ok(GetNextResult::Eof);
        }
        loop {
            // Checked per input, so long filtered scans stay
            // responsive to interruption
            self.ctx.check_interrupted()?;
            match source.pull()? {
                GetNextResult::Advanced(doc) => {
                    if self.expr.matches(&doc) {
                        return Ok(GetNextResult::Advanced(doc));
                    }
                }
                other => return Ok(other),
            }
        }
    }

    fn constraints(&self) -> StageConstraints {
        StageConstraints::streaming()
    }

    fn modified_paths(&self) -> ModifiedPaths {
        // A filter never rewrites documents
        ModifiedPaths::FiniteSet(BTreeSet::new())
    }

    fn can_swap_with_match(&self) -> bool {
        true
    }

    fn dependencies(&self, deps: &mut BTreeSet<String>) {
        self.expr.add_dependencies(deps);
    }

    fn serialize(&self, _explain: bool) -> serde_json::Value {
        json!({ "$match": self.expr.serialize() })
    }

    fn optimize(&mut self) {
        let expr = std::mem::replace(&mut self.expr, MatchExpression::AlwaysTrue);
        self.expr = expr.optimize();
    }

    fn try_absorb(
        &mut self,
        next: Box<dyn DocumentSource>,
    ) -> std::result::Result<(), Box<dyn DocumentSource>> {
        // Adjacent $match stages fuse into one conjunction
        if next.as_any().is::<MatchStage>() {
            let next = next
                .as_any()
                .downcast_ref::<MatchStage>()
                .expect("checked downcast")
                .expr
                .clone();
            let current = std::mem::replace(&mut self.expr, MatchExpression::AlwaysTrue);
            self.expr = MatchExpression::And(vec![current, next]).optimize();
            return Ok(());
        }
        Err(next)
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
