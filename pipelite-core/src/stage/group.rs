// pipelite-core/src/stage/group.rs
// $group: hashed accumulation with spill-to-disk, plus a streaming
// mode for inputs already sorted by the group key
//
// Unsorted execution keys a hash table by the computed _id; crossing
// the memory budget writes the table out as a sorted run and the
// drain phase k-way-merges runs with the resident remainder. The
// streaming mode emits each group at its key-change boundary with
// bounded extra memory.

use crate::accumulator::{AccumulationStatement, Accumulator};
use crate::context::ExpressionContext;
use crate::document::{Document, DocumentBuilder};
use crate::error::{PipeLiteError, Result};
use crate::expression::Expression;
use crate::sorter::{ExternalSorter, SortEntry, SortedStream};
use crate::stage::{
    DocumentSource, GetNextResult, ModifiedPaths, Source, StageConstraints, StageSplit,
};
use crate::value::{Value, ValueComparator};
use ahash::AHashMap;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The `_id` specification; the output `_id` mirrors whichever form
/// defined it.
#[derive(Debug, Clone)]
pub enum GroupIdSpec {
    Single(Expression),
    Doc(Vec<(String, Expression)>),
}

struct GroupEntry {
    original_id: Value,
    accumulators: Vec<Box<dyn Accumulator>>,
}

pub struct GroupStage {
    ctx: Arc<ExpressionContext>,
    cmp: ValueComparator,
    id_spec: GroupIdSpec,
    statements: Vec<AccumulationStatement>,
    /// Inputs are partial results from other workers
    merging: bool,
    /// Outputs are partials for a downstream merge (shard side)
    produce_partials: bool,
    /// Input arrives sorted by the group key
    streaming: bool,

    // unsorted-mode state
    table: AHashMap<Value, GroupEntry>,
    memory_bytes: usize,
    sorter: Option<ExternalSorter>,
    spill_count: usize,
    drain_hash: Option<std::vec::IntoIter<(Value, GroupEntry)>>,
    drain_spill: Option<(SortedStream, Option<SortEntry>)>,
    populated: bool,

    // streaming-mode state
    current: Option<(Value, Value, Vec<Box<dyn Accumulator>>)>,
    streaming_eof: bool,

    disposed: bool,
}

pub fn parse(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    let obj = spec.as_object().ok_or_else(|| {
        PipeLiteError::InvalidPipeline("a group's fields must be specified in an object".into())
    })?;

    let id_value = obj.get("_id").ok_or_else(|| {
        PipeLiteError::InvalidPipeline("a group specification must include an _id".into())
    })?;
    let id_spec = parse_id_spec(id_value)?;

    let mut statements = Vec::new();
    for (field, value) in obj {
        if field == "_id" {
            continue;
        }
        if field.contains('.') {
            return Err(PipeLiteError::InvalidPipeline(format!(
                "the group aggregate field name '{}' cannot contain '.'",
                field
            )));
        }
        statements.push(AccumulationStatement::parse(field, value)?);
    }

    Ok(Box::new(GroupStage::new(
        ctx.clone(),
        id_spec,
        statements,
        false,
        false,
    )))
}

fn parse_id_spec(id_value: &serde_json::Value) -> Result<GroupIdSpec> {
    match id_value {
        serde_json::Value::Object(map)
            if !map.is_empty() && map.keys().all(|k| !k.starts_with('$')) =>
        {
            let mut fields = Vec::new();
            for (k, v) in map {
                fields.push((k.clone(), Expression::parse(v)?));
            }
            Ok(GroupIdSpec::Doc(fields))
        }
        other => Ok(GroupIdSpec::Single(Expression::parse(other)?)),
    }
}

impl GroupStage {
    fn new(
        ctx: Arc<ExpressionContext>,
        id_spec: GroupIdSpec,
        statements: Vec<AccumulationStatement>,
        merging: bool,
        produce_partials: bool,
    ) -> GroupStage {
        let cmp = ctx.value_comparator();
        GroupStage {
            ctx,
            cmp,
            id_spec,
            statements,
            merging,
            produce_partials,
            streaming: false,
            table: AHashMap::new(),
            memory_bytes: 0,
            sorter: None,
            spill_count: 0,
            drain_hash: None,
            drain_spill: None,
            populated: false,
            current: None,
            streaming_eof: false,
            disposed: false,
        }
    }

    pub fn spill_count(&self) -> usize {
        self.spill_count
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// When every _id component is a plain field path, returns those
    /// paths; the optimizer uses them to detect a compatible input
    /// sort order.
    pub fn id_field_paths(&self) -> Option<Vec<String>> {
        let path_of = |e: &Expression| match e {
            Expression::FieldPath(p) => Some(p.clone()),
            _ => None,
        };
        match &self.id_spec {
            GroupIdSpec::Single(e) => path_of(e).map(|p| vec![p]),
            GroupIdSpec::Doc(fields) => fields.iter().map(|(_, e)| path_of(e)).collect(),
        }
    }

    /// Switch to streaming execution. Only sound when the input is
    /// sorted so every group's documents arrive contiguously.
    pub fn enable_streaming(&mut self) {
        self.streaming = true;
    }

    fn compute_id(&self, doc: &Document) -> Result<Value> {
        match &self.id_spec {
            GroupIdSpec::Single(expr) => {
                let v = expr.evaluate(doc, &self.cmp)?;
                // A missing _id groups with null
                Ok(if v.is_missing() { Value::Null } else { v })
            }
            GroupIdSpec::Doc(fields) => {
                let mut b = DocumentBuilder::new();
                for (name, expr) in fields {
                    let v = expr.evaluate(doc, &self.cmp)?;
                    if !v.is_missing() {
                        b.set(name, v);
                    }
                }
                Ok(Value::object(b.freeze()))
            }
        }
    }

    fn make_accumulators(&self) -> Vec<Box<dyn Accumulator>> {
        self.statements
            .iter()
            .map(|s| s.make_accumulator(&self.cmp))
            .collect()
    }

    fn process_into(
        &self,
        accumulators: &mut [Box<dyn Accumulator>],
        doc: &Document,
    ) -> Result<usize> {
        let mut grown = 0usize;
        for (stmt, acc) in self.statements.iter().zip(accumulators.iter_mut()) {
            let value = stmt.argument.evaluate(doc, &self.cmp)?;
            let before = acc.memory_usage();
            acc.process(value, self.merging)?;
            grown += acc.memory_usage().saturating_sub(before);
        }
        Ok(grown)
    }

    fn accumulate(&mut self, doc: &Document) -> Result<()> {
        let id = self.compute_id(doc)?;
        let canonical = self.cmp.canonicalize(&id);

        if !self.table.contains_key(&canonical) {
            let entry = GroupEntry {
                original_id: id,
                accumulators: self.make_accumulators(),
            };
            self.memory_bytes += canonical.approximate_size()
                + entry.original_id.approximate_size()
                + entry
                    .accumulators
                    .iter()
                    .map(|a| a.memory_usage())
                    .sum::<usize>();
            self.table.insert(canonical.clone(), entry);
        }

        // Borrow dance: take the accumulators out, fold, put back
        let mut entry = self.table.remove(&canonical).expect("entry just ensured");
        let grown = self.process_into(&mut entry.accumulators, doc)?;
        self.table.insert(canonical, entry);
        self.memory_bytes += grown;

        if self.memory_bytes > self.ctx.options.max_group_memory_bytes {
            if !self.ctx.options.allow_disk_use {
                return Err(PipeLiteError::MemoryLimitExceeded(
                    "$group exceeded its memory limit and disk use is not allowed".into(),
                ));
            }
            self.spill()?;
        }
        Ok(())
    }

    /// Write the resident table out as one sorted run and clear it.
    fn spill(&mut self) -> Result<()> {
        if self.table.is_empty() {
            return Ok(());
        }
        if self.sorter.is_none() {
            // Canonical ids are compared raw: equal-under-collator ids
            // canonicalize to identical values, so runs merge correctly
            self.sorter = Some(ExternalSorter::new(
                Arc::new(|a: &Value, b: &Value| Value::compare(a, b, None)),
                usize::MAX,
                true,
                self.ctx.options.spill_dir.clone(),
            ));
        }
        let sorter = self.sorter.as_mut().expect("sorter just ensured");
        for (canonical, entry) in self.table.drain() {
            let mut partial = DocumentBuilder::new();
            partial.set("_id", entry.original_id);
            for (stmt, acc) in self.statements.iter().zip(entry.accumulators.iter()) {
                partial.set(&stmt.field_name, acc.value(true));
            }
            sorter.add(canonical, Value::object(partial.freeze()))?;
        }
        sorter.spill()?;
        self.spill_count += 1;
        self.memory_bytes = 0;
        crate::log_debug!("$group spilled to disk (spill #{})", self.spill_count);
        Ok(())
    }

    fn begin_drain(&mut self) -> Result<()> {
        self.populated = true;
        if self.sorter.is_some() {
            // Push the still-resident remainder out so everything
            // merges through one sorted stream
            self.spill()?;
            let mut stream = self
                .sorter
                .take()
                .expect("spilled sorter present")
                .finish()?;
            let head = stream.next_entry()?;
            self.drain_spill = Some((stream, head));
        } else {
            let entries: Vec<(Value, GroupEntry)> = self.table.drain().collect();
            self.drain_hash = Some(entries.into_iter());
        }
        Ok(())
    }

    fn output_doc(&self, id: Value, accumulators: &[Box<dyn Accumulator>]) -> Document {
        let mut out = DocumentBuilder::new();
        out.set("_id", id);
        for (stmt, acc) in self.statements.iter().zip(accumulators.iter()) {
            out.set(&stmt.field_name, acc.value(self.produce_partials));
        }
        out.freeze()
    }

    fn next_from_hash(&mut self) -> Option<Document> {
        let (_, entry) = self.drain_hash.as_mut()?.next()?;
        Some(self.output_doc(entry.original_id, &entry.accumulators))
    }

    /// Merge consecutive equal-key partials from the spilled runs into
    /// one finished group.
    fn next_from_spill(&mut self) -> Result<Option<Document>> {
        let Some((key, first_partial)) = self
            .drain_spill
            .as_mut()
            .and_then(|(_, head)| head.take())
        else {
            return Ok(None);
        };

        let mut accumulators = self.make_accumulators();
        let partial_doc = first_partial.as_object().cloned().unwrap_or_default();
        let id = partial_doc.get_value("_id");
        merge_partial(&self.statements, &mut accumulators, &partial_doc)?;

        loop {
            let next = {
                let (stream, _) = self.drain_spill.as_mut().expect("drain stream present");
                stream.next_entry()?
            };
            match next {
                Some((next_key, partial))
                    if Value::compare(&next_key, &key, None) == std::cmp::Ordering::Equal =>
                {
                    let partial_doc = partial.as_object().cloned().unwrap_or_default();
                    merge_partial(&self.statements, &mut accumulators, &partial_doc)?;
                }
                other => {
                    self.drain_spill.as_mut().expect("drain stream present").1 = other;
                    break;
                }
            }
        }
        Ok(Some(self.output_doc(id, &accumulators)))
    }

    fn streaming_get_next(&mut self, source: &mut dyn Source) -> Result<GetNextResult> {
        loop {
            self.ctx.check_interrupted()?;
            if self.streaming_eof {
                return Ok(GetNextResult::Eof);
            }
            match source.pull()? {
                GetNextResult::Advanced(doc) => {
                    let id = self.compute_id(&doc)?;
                    let canonical = self.cmp.canonicalize(&id);
                    let same_key =
                        matches!(&self.current, Some((key, _, _)) if *key == canonical);
                    if same_key {
                        let (key, orig, mut accs) =
                            self.current.take().expect("current group present");
                        self.process_into(&mut accs, &doc)?;
                        self.current = Some((key, orig, accs));
                    } else if self.current.is_some() {
                        // Key changed: emit the finished group and
                        // start the next one
                        let (_, prev_id, prev_accs) =
                            self.current.take().expect("current group present");
                        let mut accs = self.make_accumulators();
                        self.process_into(&mut accs, &doc)?;
                        self.current = Some((canonical, id, accs));
                        return Ok(GetNextResult::Advanced(
                            self.output_doc(prev_id, &prev_accs),
                        ));
                    } else {
                        let mut accs = self.make_accumulators();
                        self.process_into(&mut accs, &doc)?;
                        self.current = Some((canonical, id, accs));
                    }
                }
                GetNextResult::Paused => return Ok(GetNextResult::Paused),
                GetNextResult::Eof => {
                    self.streaming_eof = true;
                    if let Some((_, id, accs)) = self.current.take() {
                        return Ok(GetNextResult::Advanced(self.output_doc(id, &accs)));
                    }
                    return Ok(GetNextResult::Eof);
                }
            }
        }
    }

    fn shard_variant(&self) -> GroupStage {
        let mut stage = GroupStage::new(
            self.ctx.clone(),
            self.id_spec.clone(),
            self.statements.clone(),
            false,
            true,
        );
        stage.streaming = self.streaming;
        stage
    }

    fn merge_variant(&self) -> GroupStage {
        // The merge side regroups partial documents by their _id field
        // and folds each accumulator field in merge mode
        let statements = self
            .statements
            .iter()
            .map(|s| AccumulationStatement {
                field_name: s.field_name.clone(),
                op_name: s.op_name.clone(),
                argument: Expression::FieldPath(s.field_name.clone()),
            })
            .collect();
        GroupStage::new(
            self.ctx.clone(),
            GroupIdSpec::Single(Expression::FieldPath("_id".into())),
            statements,
            true,
            false,
        )
    }
}

fn merge_partial(
    statements: &[AccumulationStatement],
    accumulators: &mut [Box<dyn Accumulator>],
    partial: &Document,
) -> Result<()> {
    for (stmt, acc) in statements.iter().zip(accumulators.iter_mut()) {
        acc.process(partial.get_value(&stmt.field_name), true)?;
    }
    Ok(())
}

impl DocumentSource for GroupStage {
    fn source_name(&self) -> &'static str {
        "$group"
    }

    fn get_next(&mut self, source: &mut dyn Source) -> Result<GetNextResult> {
        if self.disposed {
            return Ok(GetNextResult::Eof);
        }
        if self.streaming {
            return self.streaming_get_next(source);
        }

        if !self.populated {
            loop {
                self.ctx.check_interrupted()?;
                match source.pull()? {
                    GetNextResult::Advanced(doc) => self.accumulate(&doc)?,
                    GetNextResult::Paused => return Ok(GetNextResult::Paused),
                    GetNextResult::Eof => {
                        self.begin_drain()?;
                        break;
                    }
                }
            }
        }

        self.ctx.check_interrupted()?;
        if self.drain_spill.is_some() {
            return Ok(match self.next_from_spill()? {
                Some(doc) => GetNextResult::Advanced(doc),
                None => GetNextResult::Eof,
            });
        }
        Ok(match self.next_from_hash() {
            Some(doc) => GetNextResult::Advanced(doc),
            None => GetNextResult::Eof,
        })
    }

    fn constraints(&self) -> StageConstraints {
        if self.streaming {
            StageConstraints::streaming()
        } else {
            StageConstraints::blocking()
        }
    }

    fn modified_paths(&self) -> ModifiedPaths {
        // The output document is rebuilt from scratch
        ModifiedPaths::AllPaths
    }

    fn dependencies(&self, deps: &mut BTreeSet<String>) {
        match &self.id_spec {
            GroupIdSpec::Single(e) => e.add_dependencies(deps),
            GroupIdSpec::Doc(fields) => {
                for (_, e) in fields {
                    e.add_dependencies(deps);
                }
            }
        }
        for stmt in &self.statements {
            stmt.argument.add_dependencies(deps);
        }
    }

    fn serialize(&self, explain: bool) -> serde_json::Value {
        let mut spec = serde_json::Map::new();
        let id = match &self.id_spec {
            GroupIdSpec::Single(e) => e.serialize(),
            GroupIdSpec::Doc(fields) => {
                let mut m = serde_json::Map::new();
                for (k, e) in fields {
                    m.insert(k.clone(), e.serialize());
                }
                serde_json::Value::Object(m)
            }
        };
        spec.insert("_id".into(), id);
        for stmt in &self.statements {
            spec.insert(stmt.field_name.clone(), stmt.serialize());
        }
        if explain && self.merging {
            spec.insert("$doingMerge".into(), json!(true));
        }
        json!({ "$group": serde_json::Value::Object(spec) })
    }

    fn dispose(&mut self) {
        self.table.clear();
        self.sorter = None;
        self.drain_hash = None;
        self.drain_spill = None;
        self.current = None;
        self.memory_bytes = 0;
        self.disposed = true;
    }

    fn split_for_distribution(self: Box<Self>) -> StageSplit {
        let shard = Box::new(self.shard_variant());
        let merge = Box::new(self.merge_variant());
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
