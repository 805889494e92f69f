// pipelite-core/src/lite_parse.rs
// First-phase pipeline validation: shape, stage names, namespaces
//
// Lite parsing checks everything that can be checked without building
// expression trees: one-key stage objects, known stage names, initial
// position rules, and which foreign collections the pipeline touches
// (for privilege checks and the view dependency graph).

use crate::error::{PipeLiteError, Result};
use crate::stage::{stage_descriptor, stage_name_and_spec};

#[derive(Debug, Clone, Default)]
pub struct LiteParsedPipeline {
    stage_names: Vec<String>,
    involved_collections: Vec<String>,
}

impl LiteParsedPipeline {
    pub fn parse(stages: &[serde_json::Value]) -> Result<LiteParsedPipeline> {
        let mut lite = LiteParsedPipeline::default();
        for (idx, stage) in stages.iter().enumerate() {
            let (name, spec) = stage_name_and_spec(stage)?;
            let descriptor = stage_descriptor(name)?;
            if descriptor.initial_only && idx != 0 {
                return Err(PipeLiteError::InvalidPipeline(format!(
                    "{} is only valid as the first stage in a pipeline",
                    name
                )));
            }
            if matches!(name.as_str(), "$lookup" | "$graphLookup") {
                if let Some(from) = spec.get("from").and_then(|v| v.as_str()) {
                    lite.involved_collections.push(from.to_string());
                }
            }
            lite.stage_names.push(name.clone());
        }
        Ok(lite)
    }

    pub fn stage_names(&self) -> &[String] {
        &self.stage_names
    }

    /// Foreign collections referenced by $lookup/$graphLookup.
    pub fn involved_collections(&self) -> &[String] {
        &self.involved_collections
    }

    pub fn starts_with(&self, stage_name: &str) -> bool {
        self.stage_names.first().map(String::as_str) == Some(stage_name)
    }
}
