// pipelite-core/src/stage/source.rs
// Initial sources: cursor adapter, in-memory queue, $collStats

use crate::context::{CursorEvent, ExpressionContext, RecordCursor};
use crate::document::Document;
use crate::error::{PipeLiteError, Result};
use crate::stage::{
    DocumentSource, GetNextResult, Source, StageConstraints, StageSplit,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;

// ============================================================================
// CURSOR ADAPTER
// ============================================================================

/// Adapts the external [`RecordCursor`] seam into a pipeline-initial
/// stage. Pause events from the collaborator surface unchanged.
pub struct CursorStage {
    ctx: Arc<ExpressionContext>,
    cursor: Option<Box<dyn RecordCursor>>,
}

impl CursorStage {
    pub fn new(ctx: Arc<ExpressionContext>, cursor: Box<dyn RecordCursor>) -> CursorStage {
        CursorStage {
            ctx,
            cursor: Some(cursor),
        }
    }
}

impl DocumentSource for CursorStage {
    fn source_name(&self) -> &'static str {
        "$cursor"
    }

    fn get_next(&mut self, _source: &mut dyn Source) -> Result<GetNextResult> {
        self.ctx.check_interrupted()?;
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(GetNextResult::Eof);
        };
        Ok(match cursor.next_record()? {
            CursorEvent::Advanced(doc) => GetNextResult::Advanced(doc),
            CursorEvent::Paused => GetNextResult::Paused,
            CursorEvent::Eof => {
                self.cursor = None;
                GetNextResult::Eof
            }
        })
    }

    fn constraints(&self) -> StageConstraints {
        StageConstraints::initial_source()
    }

    fn serialize(&self, _explain: bool) -> serde_json::Value {
        json!({"$cursor": {}})
    }

    fn dispose(&mut self) {
        self.cursor = None;
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

// ============================================================================
// QUEUE SOURCE
// ============================================================================

/// In-memory initial source feeding a fixed event sequence; the
/// standard way tests (and $facet-style buffering) drive a pipeline.
pub struct QueueStage {
    ctx: Arc<ExpressionContext>,
    queue: VecDeque<GetNextResult>,
    disposed: bool,
}

impl QueueStage {
    pub fn new(ctx: Arc<ExpressionContext>) -> QueueStage {
        QueueStage {
            ctx,
            queue: VecDeque::new(),
            disposed: false,
        }
    }

    pub fn with_documents(ctx: Arc<ExpressionContext>, docs: Vec<Document>) -> QueueStage {
        let mut stage = QueueStage::new(ctx);
        for doc in docs {
            stage.queue.push_back(GetNextResult::Advanced(doc));
        }
        stage
    }

    /// Exact event sequence, pauses included, for pause-propagation
    /// tests.
    pub fn with_results(
        ctx: Arc<ExpressionContext>,
        results: Vec<GetNextResult>,
    ) -> QueueStage {
        let mut stage = QueueStage::new(ctx);
        stage.queue = results.into();
        stage
    }

    pub fn push(&mut self, doc: Document) {
        self.queue.push_back(GetNextResult::Advanced(doc));
    }
}

impl DocumentSource for QueueStage {
    fn source_name(&self) -> &'static str {
        "$queue"
    }

    fn get_next(&mut self, _source: &mut dyn Source) -> Result<GetNextResult> {
        self.ctx.check_interrupted()?;
        if self.disposed {
            return Ok(GetNextResult::Eof);
        }
        Ok(self.queue.pop_front().unwrap_or(GetNextResult::Eof))
    }

    fn constraints(&self) -> StageConstraints {
        StageConstraints::initial_source()
    }

    fn serialize(&self, _explain: bool) -> serde_json::Value {
        let docs: Vec<serde_json::Value> = self
            .queue
            .iter()
            .filter_map(|r| match r {
                GetNextResult::Advanced(d) => Some(d.to_json()),
                _ => None,
            })
            .collect();
        json!({ "$queue": docs })
    }

    fn dispose(&mut self) {
        self.queue.clear();
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

// ============================================================================
// $collStats
// ============================================================================

/// Initial-only stage materializing a collection-statistics snapshot
/// from the process delegate.
pub struct CollStatsStage {
    ctx: Arc<ExpressionContext>,
    emitted: bool,
}

pub fn parse_coll_stats(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    if !spec.is_object() {
        return Err(PipeLiteError::InvalidPipeline(
            "$collStats argument must be an object".to_string(),
        ));
    }
    Ok(Box::new(CollStatsStage {
        ctx: ctx.clone(),
        emitted: false,
    }))
}

impl DocumentSource for CollStatsStage {
    fn source_name(&self) -> &'static str {
        "$collStats"
    }

    fn get_next(&mut self, _source: &mut dyn Source) -> Result<GetNextResult> {
        self.ctx.check_interrupted()?;
        if self.emitted {
            return Ok(GetNextResult::Eof);
        }
        self.emitted = true;
        let stats = self
            .ctx
            .process_interface()?
            .collection_stats(&self.ctx.namespace)?;
        Ok(GetNextResult::Advanced(stats))
    }

    fn constraints(&self) -> StageConstraints {
        let mut constraints = StageConstraints::initial_source();
        constraints.host_requirement = crate::stage::HostTypeRequirement::AnyShard;
        constraints
    }

    fn serialize(&self, _explain: bool) -> serde_json::Value {
        json!({"$collStats": {}})
    }

    fn dispose(&mut self) {
        self.emitted = true;
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
