// pipelite-core/src/stage/sort.rs
// $sort: blocking sort over the external-merge sorter, with $limit
// absorption into a bounded top-k buffer

use crate::context::ExpressionContext;
use crate::document::Document;
use crate::error::{PipeLiteError, Result};
use crate::sorter::{ExternalSorter, KeyComparator, SortedStream};
use crate::stage::limit_skip::LimitStage;
use crate::stage::{
    DocumentSource, GetNextResult, ModifiedPaths, Source, StageConstraints, StageSplit,
};
use crate::value::Value;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct SortStage {
    ctx: Arc<ExpressionContext>,
    /// (path, direction): 1 ascending, -1 descending
    pattern: Vec<(String, i32)>,
    /// Sort by the out-of-band random key instead of field values
    /// (the $sample funnel)
    by_rand_key: bool,
    limit: Option<u64>,
    sorter: Option<ExternalSorter>,
    stream: Option<SortedStream>,
    disposed: bool,
}

pub fn parse(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    let obj = spec.as_object().ok_or_else(|| {
        PipeLiteError::InvalidPipeline("the $sort key specification must be an object".into())
    })?;
    if obj.is_empty() {
        return Err(PipeLiteError::InvalidPipeline(
            "the sort key specification must not be empty".into(),
        ));
    }
    let mut pattern = Vec::new();
    for (field, dir) in obj {
        let direction = match dir.as_i64() {
            Some(1) => 1,
            Some(-1) => -1,
            _ => {
                return Err(PipeLiteError::InvalidPipeline(format!(
                    "invalid sort direction for field '{}': expected 1 or -1",
                    field
                )))
            }
        };
        pattern.push((field.clone(), direction));
    }
    Ok(Box::new(SortStage::new(ctx.clone(), pattern)))
}

impl SortStage {
    pub fn new(ctx: Arc<ExpressionContext>, pattern: Vec<(String, i32)>) -> SortStage {
        SortStage {
            ctx,
            pattern,
            by_rand_key: false,
            limit: None,
            sorter: None,
            stream: None,
            disposed: false,
        }
    }

    /// The $sample funnel: ascending sort on the random metadata key.
    pub fn by_rand_key(ctx: Arc<ExpressionContext>, limit: Option<u64>) -> SortStage {
        SortStage {
            ctx,
            pattern: Vec::new(),
            by_rand_key: true,
            limit,
            sorter: None,
            stream: None,
            disposed: false,
        }
    }

    pub fn pattern(&self) -> &[(String, i32)] {
        &self.pattern
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: u64) {
        self.limit = Some(self.limit.map_or(limit, |l| l.min(limit)));
    }

    /// Fresh unexecuted copy with the same spec (shard/merge halves).
    fn fresh_copy(&self) -> SortStage {
        SortStage {
            ctx: self.ctx.clone(),
            pattern: self.pattern.clone(),
            by_rand_key: self.by_rand_key,
            limit: self.limit,
            sorter: None,
            stream: None,
            disposed: false,
        }
    }

    fn key_comparator(&self) -> KeyComparator {
        if self.by_rand_key {
            return Arc::new(|a: &Value, b: &Value| Value::compare(a, b, None));
        }
        let directions: Vec<i32> = self.pattern.iter().map(|(_, d)| *d).collect();
        let collator = self.ctx.collator_arc();
        Arc::new(move |a: &Value, b: &Value| {
            let (Some(xs), Some(ys)) = (a.as_array(), b.as_array()) else {
                return Value::compare(a, b, collator.as_deref());
            };
            for (i, dir) in directions.iter().enumerate() {
                let x = xs.get(i).unwrap_or(&Value::Missing);
                let y = ys.get(i).unwrap_or(&Value::Missing);
                let cmp = Value::compare(x, y, collator.as_deref());
                let cmp = if *dir < 0 { cmp.reverse() } else { cmp };
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            Ordering::Equal
        })
    }

    fn make_key(&self, doc: &Document) -> Value {
        if self.by_rand_key {
            return Value::Double(doc.metadata().rand_sort_key.unwrap_or(0.0));
        }
        Value::array(
            self.pattern
                .iter()
                .map(|(path, _)| doc.get_path(path))
                .collect(),
        )
    }

    fn ensure_sorter(&mut self) -> &mut ExternalSorter {
        if self.sorter.is_none() {
            let mut sorter = ExternalSorter::new(
                self.key_comparator(),
                self.ctx.options.max_sort_memory_bytes,
                self.ctx.options.allow_disk_use,
                self.ctx.options.spill_dir.clone(),
            );
            if let Some(limit) = self.limit {
                sorter = sorter.with_limit(limit as usize);
            }
            self.sorter = Some(sorter);
        }
        self.sorter.as_mut().expect("sorter just ensured")
    }
}

impl DocumentSource for SortStage {
    fn source_name(&self) -> &'static str {
        "$sort"
    }

    fn get_next(&mut self, source: &mut dyn Source) -> Result<GetNextResult> {
        if self.disposed {
            return Ok(GetNextResult::Eof);
        }
        if self.stream.is_none() {
            loop {
                self.ctx.check_interrupted()?;
                match source.pull()? {
                    GetNextResult::Advanced(doc) => {
                        let key = self.make_key(&doc);
                        self.ensure_sorter().add(key, Value::object(doc))?;
                    }
                    GetNextResult::Paused => return Ok(GetNextResult::Paused),
                    GetNextResult::Eof => {
                        let sorter = self.sorter.take().unwrap_or_else(|| {
                            ExternalSorter::new(
                                self.key_comparator(),
                                usize::MAX,
                                false,
                                None,
                            )
                        });
                        self.stream = Some(sorter.finish()?);
                        break;
                    }
                }
            }
        }

        self.ctx.check_interrupted()?;
        let stream = self.stream.as_mut().expect("drain stream present");
        Ok(match stream.next_entry()? {
            Some((_, payload)) => match payload {
                Value::Object(doc) => {
                    GetNextResult::Advanced(Arc::try_unwrap(doc).unwrap_or_else(|d| (*d).clone()))
                }
                _ => GetNextResult::Eof,
            },
            None => GetNextResult::Eof,
        })
    }

    fn constraints(&self) -> StageConstraints {
        StageConstraints::blocking()
    }

    fn modified_paths(&self) -> ModifiedPaths {
        // Reordering only; documents pass through untouched
        ModifiedPaths::FiniteSet(BTreeSet::new())
    }

    fn can_swap_with_match(&self) -> bool {
        true
    }

    fn dependencies(&self, deps: &mut BTreeSet<String>) {
        for (path, _) in &self.pattern {
            deps.insert(path.clone());
        }
    }

    fn serialize(&self, explain: bool) -> serde_json::Value {
        let mut key = serde_json::Map::new();
        for (field, dir) in &self.pattern {
            key.insert(field.clone(), json!(dir));
        }
        if explain {
            let mut spec = serde_json::Map::new();
            spec.insert("sortKey".into(), serde_json::Value::Object(key));
            if let Some(limit) = self.limit {
                spec.insert("limit".into(), json!(limit));
            }
            json!({ "$sort": serde_json::Value::Object(spec) })
        } else {
            json!({ "$sort": serde_json::Value::Object(key) })
        }
    }

    fn try_absorb(
        &mut self,
        next: Box<dyn DocumentSource>,
    ) -> std::result::Result<(), Box<dyn DocumentSource>> {
        // A following $limit becomes a bounded top-k buffer instead of
        // a separate stage
        if let Some(limit) = next.as_any().downcast_ref::<LimitStage>() {
            self.set_limit(limit.limit());
            return Ok(());
        }
        Err(next)
    }

    fn dispose(&mut self) {
        self.sorter = None;
        self.stream = None;
        self.disposed = true;
    }

    fn split_for_distribution(self: Box<Self>) -> StageSplit {
        // Shards sort locally; the merge side re-sorts the combined
        // stream (and re-applies any limit)
        let shard = Box::new(self.fresh_copy());
        let merge = Box::new(self.fresh_copy());
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
