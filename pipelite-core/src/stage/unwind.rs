// pipelite-core/src/stage/unwind.rs
// $unwind: unroll an array field into one document per element

use crate::context::ExpressionContext;
use crate::document::{Document, DocumentBuilder};
use crate::error::{PipeLiteError, Result};
use crate::stage::{
    DocumentSource, GetNextResult, ModifiedPaths, Source, StageConstraints, StageSplit,
};
use crate::value::Value;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Parsed $unwind options, also reused by $lookup/$graphLookup when
/// they absorb a following unwind.
#[derive(Debug, Clone)]
pub struct UnwindSpec {
    /// Field path without the leading `$`
    pub path: String,
    pub preserve_null_and_empty: bool,
    pub include_array_index: Option<String>,
}

impl UnwindSpec {
    pub fn parse(spec: &serde_json::Value) -> Result<UnwindSpec> {
        let parse_path = |s: &str| -> Result<String> {
            s.strip_prefix('$')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    PipeLiteError::InvalidPipeline(
                        "$unwind path must start with '$'".to_string(),
                    )
                })
        };
        match spec {
            serde_json::Value::String(s) => Ok(UnwindSpec {
                path: parse_path(s)?,
                preserve_null_and_empty: false,
                include_array_index: None,
            }),
            serde_json::Value::Object(map) => {
                let path = map
                    .get("path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        PipeLiteError::InvalidPipeline(
                            "$unwind requires a 'path' field".to_string(),
                        )
                    })?;
                let preserve = map
                    .get("preserveNullAndEmptyArrays")
                    .map(|v| {
                        v.as_bool().ok_or_else(|| {
                            PipeLiteError::InvalidPipeline(
                                "preserveNullAndEmptyArrays must be a boolean".to_string(),
                            )
                        })
                    })
                    .transpose()?
                    .unwrap_or(false);
                let index_field = map
                    .get("includeArrayIndex")
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            PipeLiteError::InvalidPipeline(
                                "includeArrayIndex must be a string".to_string(),
                            )
                        })
                    })
                    .transpose()?;
                for key in map.keys() {
                    if !matches!(
                        key.as_str(),
                        "path" | "preserveNullAndEmptyArrays" | "includeArrayIndex"
                    ) {
                        return Err(PipeLiteError::InvalidPipeline(format!(
                            "unrecognized option to $unwind: {}",
                            key
                        )));
                    }
                }
                Ok(UnwindSpec {
                    path: parse_path(path)?,
                    preserve_null_and_empty: preserve,
                    include_array_index: index_field,
                })
            }
            _ => Err(PipeLiteError::InvalidPipeline(
                "$unwind requires a path string or an options object".to_string(),
            )),
        }
    }

    pub fn serialize(&self) -> serde_json::Value {
        if !self.preserve_null_and_empty && self.include_array_index.is_none() {
            return json!(format!("${}", self.path));
        }
        let mut spec = serde_json::Map::new();
        spec.insert("path".into(), json!(format!("${}", self.path)));
        if self.preserve_null_and_empty {
            spec.insert("preserveNullAndEmptyArrays".into(), json!(true));
        }
        if let Some(f) = &self.include_array_index {
            spec.insert("includeArrayIndex".into(), json!(f));
        }
        serde_json::Value::Object(spec)
    }

    /// Expand one input document into its unwound outputs.
    pub fn unwind(&self, doc: &Document) -> Vec<Document> {
        let value = doc.get_path(&self.path);
        match value {
            Value::Array(arr) => {
                if arr.is_empty() {
                    if self.preserve_null_and_empty {
                        let mut b = DocumentBuilder::from_document(doc);
                        b.remove_path(&self.path);
                        if let Some(f) = &self.include_array_index {
                            b.set_path(f, Value::Null);
                        }
                        vec![b.freeze()]
                    } else {
                        vec![]
                    }
                } else {
                    arr.iter()
                        .enumerate()
                        .map(|(i, elem)| {
                            let mut b = DocumentBuilder::from_document(doc);
                            b.set_path(&self.path, elem.clone());
                            if let Some(f) = &self.include_array_index {
                                b.set_path(f, Value::Int64(i as i64));
                            }
                            b.freeze()
                        })
                        .collect()
                }
            }
            Value::Missing | Value::Null => {
                if self.preserve_null_and_empty {
                    let mut b = DocumentBuilder::from_document(doc);
                    if let Some(f) = &self.include_array_index {
                        b.set_path(f, Value::Null);
                    }
                    vec![b.freeze()]
                } else {
                    vec![]
                }
            }
            // Non-array values unwind to themselves
            _ => {
                let mut b = DocumentBuilder::from_document(doc);
                if let Some(f) = &self.include_array_index {
                    b.set_path(f, Value::Null);
                }
                vec![b.freeze()]
            }
        }
    }
}

pub struct UnwindStage {
    ctx: Arc<ExpressionContext>,
    spec: UnwindSpec,
    pending: Vec<Document>,
    disposed: bool,
}

pub fn parse(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    Ok(Box::new(UnwindStage {
        ctx: ctx.clone(),
        spec: UnwindSpec::parse(spec)?,
        pending: Vec::new(),
        disposed: false,
    }))
}

impl UnwindStage {
    pub fn spec(&self) -> &UnwindSpec {
        &self.spec
    }
}

impl DocumentSource for UnwindStage {
    fn source_name(&self) -> &'static str {
        "$unwind"
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
                    self.pending = self.spec.unwind(&doc);
                }
                other => return Ok(other),
            }
        }
    }

    fn constraints(&self) -> StageConstraints {
        StageConstraints::streaming()
    }

    fn modified_paths(&self) -> ModifiedPaths {
        let mut paths: BTreeSet<String> = [self.spec.path.clone()].into_iter().collect();
        if let Some(f) = &self.spec.include_array_index {
            paths.insert(f.clone());
        }
        ModifiedPaths::FiniteSet(paths)
    }

    fn can_swap_with_match(&self) -> bool {
        true
    }

    fn dependencies(&self, deps: &mut BTreeSet<String>) {
        deps.insert(self.spec.path.clone());
    }

    fn serialize(&self, _explain: bool) -> serde_json::Value {
        json!({ "$unwind": self.spec.serialize() })
    }

    fn dispose(&mut self) {
        self.pending.clear();
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
