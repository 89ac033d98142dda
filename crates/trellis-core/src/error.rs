use std::path::PathBuf;

use crate::value::ValueKind;

/// Errors produced by step construction, graph resolution, execution, and caching.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("invalid characters in version '{version}' of step class '{class}'")]
    InvalidVersion { class: String, version: String },

    #[error("step {name} is configured to use the cache, but it's not a cacheable step")]
    NotCacheable { name: String },

    #[error("step {name}'s cache_results parameter is set to an invalid value")]
    InvalidCacheResults { name: String },

    #[error("ensure_result() does not make sense on step {name}, which does not cache its results")]
    EnsureUncacheable { name: String },

    #[error("duplicate step name '{name}'")]
    DuplicateStepName { name: String },

    #[error("a step class named '{type_tag}' is already registered")]
    DuplicateStepType { type_tag: String },

    #[error(
        "cannot parse steps {}; do you have a circle in your steps, \
         or are you referring to a step that doesn't exist?",
        names.join(", ")
    )]
    UnresolvableSteps { names: Vec<String> },

    #[error("unknown step type '{type_tag}'")]
    UnknownStepType { type_tag: String },

    #[error("step class '{class}' does not accept a parameter named '{param}'")]
    UnknownParam { class: String, param: String },

    #[error("step class '{class}' requires a parameter named '{param}'")]
    MissingParam { class: String, param: String },

    #[error("parameter '{param}' of step class '{class}' expects {expected}, got {actual}")]
    ParamType {
        class: String,
        param: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("step {name} returns {actual}, but {class} expects {expected}")]
    ReturnTypeMismatch {
        name: String,
        class: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("malformed parameters for step '{name}': {message}")]
    MalformedParams { name: String, message: String },

    #[error(
        "step {name} is still a reference to '{target}'; reference steps cannot be executed, \
         they are only useful while parsing a workflow"
    )]
    UnresolvedRef { name: String, target: String },

    #[error("{} already exists, will not overwrite", path.display())]
    WouldOverwrite { path: PathBuf },

    #[error("a step's run() method can only be entered once at a time (step {name})")]
    RunInProgress { name: String },

    #[error("step {name} has no cached result")]
    NotCached { name: String },

    #[error("step {name} failed: {source}")]
    Execution {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepError {
    /// Wrap an arbitrary failure from inside a step's run function.
    pub fn execution(
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Execution {
            name: name.into(),
            source: source.into(),
        }
    }
}
