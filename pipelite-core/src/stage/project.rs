// pipelite-core/src/stage/project.rs
// $project and $addFields: declarative document reshaping
//
// Both parse into the same computed-field tree; they differ in mode.
// Conflicting paths and inclusion/exclusion mixing are rejected at
// parse time, before any document flows.

use crate::context::ExpressionContext;
use crate::document::{Document, DocumentBuilder};
use crate::error::{PipeLiteError, Result};
use crate::expression::Expression;
use crate::stage::{
    DocumentSource, GetNextResult, ModifiedPaths, Source, StageConstraints, StageSplit,
};
use crate::value::ValueComparator;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectMode {
    Inclusion,
    Exclusion,
    AddFields,
}

#[derive(Debug, Clone)]
enum ProjectAction {
    Include,
    Exclude,
    Computed(Expression),
}

pub struct ProjectStage {
    ctx: Arc<ExpressionContext>,
    mode: ProjectMode,
    /// Spec order preserved for serialization and output shape
    entries: Vec<(String, ProjectAction)>,
    exclude_id: bool,
    cmp: ValueComparator,
    disposed: bool,
}

pub fn parse_project(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    ProjectStage::parse(spec, ctx, false)
}

pub fn parse_add_fields(
    spec: &serde_json::Value,
    ctx: &Arc<ExpressionContext>,
) -> Result<Box<dyn DocumentSource>> {
    ProjectStage::parse(spec, ctx, true)
}

impl ProjectStage {
    fn parse(
        spec: &serde_json::Value,
        ctx: &Arc<ExpressionContext>,
        add_fields: bool,
    ) -> Result<Box<dyn DocumentSource>> {
        let stage_name = if add_fields { "$addFields" } else { "$project" };
        let obj = spec.as_object().ok_or_else(|| {
            PipeLiteError::InvalidProjection(format!("{} requires an object", stage_name))
        })?;
        if obj.is_empty() {
            return Err(PipeLiteError::InvalidProjection(format!(
                "{} requires at least one field",
                stage_name
            )));
        }

        let mut entries: Vec<(String, ProjectAction)> = Vec::new();
        let mut exclude_id = false;
        for (path, value) in obj {
            if path.is_empty() || path.starts_with('$') {
                return Err(PipeLiteError::InvalidProjection(format!(
                    "invalid field name '{}'",
                    path
                )));
            }
            let action = if add_fields {
                ProjectAction::Computed(Expression::parse(value)?)
            } else {
                match value {
                    serde_json::Value::Number(n) => {
                        if n.as_f64() == Some(0.0) {
                            ProjectAction::Exclude
                        } else {
                            ProjectAction::Include
                        }
                    }
                    serde_json::Value::Bool(b) => {
                        if *b {
                            ProjectAction::Include
                        } else {
                            ProjectAction::Exclude
                        }
                    }
                    other => ProjectAction::Computed(Expression::parse(other)?),
                }
            };
            if path == "_id" && matches!(action, ProjectAction::Exclude) {
                exclude_id = true;
                continue;
            }
            entries.push((path.clone(), action));
        }

        // Conflicting paths: specifying both a and a.b is ambiguous
        for (i, (a, _)) in entries.iter().enumerate() {
            for (b, _) in entries.iter().skip(i + 1) {
                if a == b
                    || a.starts_with(&format!("{}.", b))
                    || b.starts_with(&format!("{}.", a))
                {
                    return Err(PipeLiteError::InvalidProjection(format!(
                        "specification contains two conflicting paths: '{}' and '{}'",
                        a, b
                    )));
                }
            }
        }

        let mode = if add_fields {
            ProjectMode::AddFields
        } else {
            let has_include = entries
                .iter()
                .any(|(_, a)| matches!(a, ProjectAction::Include));
            let has_computed = entries
                .iter()
                .any(|(_, a)| matches!(a, ProjectAction::Computed(_)));
            let has_exclude = entries
                .iter()
                .any(|(_, a)| matches!(a, ProjectAction::Exclude));

            if has_exclude && (has_include || has_computed) {
                return Err(PipeLiteError::InvalidProjection(
                    "cannot mix inclusions and exclusions (except for '_id')".to_string(),
                ));
            }
            if has_exclude || (entries.is_empty() && exclude_id) {
                ProjectMode::Exclusion
            } else {
                ProjectMode::Inclusion
            }
        };

        Ok(Box::new(ProjectStage {
            ctx: ctx.clone(),
            mode,
            entries,
            exclude_id,
            cmp: ctx.value_comparator(),
            disposed: false,
        }))
    }

    fn apply(&self, doc: &Document) -> Result<Document> {
        match self.mode {
            ProjectMode::Inclusion => {
                let mut out = DocumentBuilder::new();
                if !self.exclude_id {
                    let id = doc.get_value("_id");
                    if !id.is_missing() {
                        out.set("_id", id);
                    }
                }
                for (path, action) in &self.entries {
                    match action {
                        ProjectAction::Include => {
                            let v = doc.get_path(path);
                            if !v.is_missing() {
                                out.set_path(path, v);
                            }
                        }
                        ProjectAction::Computed(expr) => {
                            let v = expr.evaluate(doc, &self.cmp)?;
                            if !v.is_missing() {
                                out.set_path(path, v);
                            }
                        }
                        ProjectAction::Exclude => {}
                    }
                }
                Ok(out.freeze())
            }
            ProjectMode::Exclusion => {
                let mut out = DocumentBuilder::from_document(doc);
                if self.exclude_id {
                    out.remove("_id");
                }
                for (path, action) in &self.entries {
                    if matches!(action, ProjectAction::Exclude) {
                        out.remove_path(path);
                    }
                }
                Ok(out.freeze())
            }
            ProjectMode::AddFields => {
                let mut out = DocumentBuilder::from_document(doc);
                for (path, action) in &self.entries {
                    if let ProjectAction::Computed(expr) = action {
                        let v = expr.evaluate(doc, &self.cmp)?;
                        if v.is_missing() {
                            // $$REMOVE semantics
                            out.remove_path(path);
                        } else {
                            out.set_path(path, v);
                        }
                    }
                }
                Ok(out.freeze())
            }
        }
    }
}

impl DocumentSource for ProjectStage {
    fn source_name(&self) -> &'static str {
        match self.mode {
            ProjectMode::AddFields => "$addFields",
            _ => "$project",
        }
    }

    fn get_next(&mut self, source: &mut dyn Source) -> Result<GetNextResult> {
        if self.disposed {
            return Ok(GetNextResult::Eof);
        }
        self.ctx.check_interrupted()?;
        match source.pull()? {
            GetNextResult::Advanced(doc) => Ok(GetNextResult::Advanced(self.apply(&doc)?)),
            other => Ok(other),
        }
    }

    fn constraints(&self) -> StageConstraints {
        StageConstraints::streaming()
    }

    fn modified_paths(&self) -> ModifiedPaths {
        match self.mode {
            ProjectMode::Inclusion => {
                // Everything not explicitly included (and not computed)
                // is dropped
                let mut kept: BTreeSet<String> = self
                    .entries
                    .iter()
                    .filter(|(_, a)| matches!(a, ProjectAction::Include))
                    .map(|(p, _)| p.clone())
                    .collect();
                if !self.exclude_id {
                    kept.insert("_id".to_string());
                }
                ModifiedPaths::AllExcept(kept)
            }
            ProjectMode::Exclusion => {
                let mut removed: BTreeSet<String> = self
                    .entries
                    .iter()
                    .filter(|(_, a)| matches!(a, ProjectAction::Exclude))
                    .map(|(p, _)| p.clone())
                    .collect();
                if self.exclude_id {
                    removed.insert("_id".to_string());
                }
                ModifiedPaths::FiniteSet(removed)
            }
            ProjectMode::AddFields => ModifiedPaths::FiniteSet(
                self.entries.iter().map(|(p, _)| p.clone()).collect(),
            ),
        }
    }

    fn can_swap_with_match(&self) -> bool {
        true
    }

    fn dependencies(&self, deps: &mut BTreeSet<String>) {
        for (path, action) in &self.entries {
            match action {
                ProjectAction::Include => {
                    deps.insert(path.clone());
                }
                ProjectAction::Computed(expr) => expr.add_dependencies(deps),
                ProjectAction::Exclude => {}
            }
        }
        if self.mode == ProjectMode::Inclusion && !self.exclude_id {
            deps.insert("_id".to_string());
        }
    }

    fn serialize(&self, _explain: bool) -> serde_json::Value {
        let mut spec = serde_json::Map::new();
        if self.exclude_id {
            spec.insert("_id".to_string(), serde_json::json!(0));
        }
        for (path, action) in &self.entries {
            let value = match action {
                ProjectAction::Include => serde_json::json!(1),
                ProjectAction::Exclude => serde_json::json!(0),
                ProjectAction::Computed(expr) => expr.serialize(),
            };
            spec.insert(path.clone(), value);
        }
        let mut wrapper = serde_json::Map::new();
        wrapper.insert(
            self.source_name().to_string(),
            serde_json::Value::Object(spec),
        );
        serde_json::Value::Object(wrapper)
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
