//! Lookup of step classes by their registered tag.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::StepError;
use crate::step::{ParamSpec, StepDefinition};
use crate::value::ValueKind;

/// The tag of the built-in reference placeholder class.
pub const REF_STEP_TAG: &str = "ref";

/// Maps class tags to step definitions.
///
/// The resolver consults this to turn `type` keys in raw config trees into
/// step classes. The `"ref"` placeholder class is pre-registered.
#[derive(Debug)]
pub struct StepRegistry {
    definitions: BTreeMap<String, Arc<StepDefinition>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            definitions: BTreeMap::new(),
        };
        registry
            .definitions
            .insert(REF_STEP_TAG.to_string(), Arc::new(ref_step_definition()));
        registry
    }

    /// Register a step class. Fails on duplicate tags and invalid versions.
    pub fn register(&mut self, definition: StepDefinition) -> Result<(), StepError> {
        definition.validate_version()?;
        let tag = definition.class_tag().to_string();
        if self.definitions.contains_key(&tag) {
            return Err(StepError::DuplicateStepType { type_tag: tag });
        }
        self.definitions.insert(tag, Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, type_tag: &str) -> Result<Arc<StepDefinition>, StepError> {
        self.definitions
            .get(type_tag)
            .cloned()
            .ok_or_else(|| StepError::UnknownStepType {
                type_tag: type_tag.to_string(),
            })
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.definitions.contains_key(type_tag)
    }

    /// The registered tags, sorted.
    pub fn list_available(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The `"ref"` class: a placeholder for a forward name-reference.
///
/// The resolver replaces every reference with its target before a graph is
/// returned, so running one is always a configuration mistake.
fn ref_step_definition() -> StepDefinition {
    StepDefinition::new(REF_STEP_TAG, |ctx| {
        let target = ctx
            .get("ref")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();
        Err(StepError::UnresolvedRef {
            name: ctx.step_name().to_string(),
            target,
        })
    })
    .param(ParamSpec::required("ref", ValueKind::String))
}
