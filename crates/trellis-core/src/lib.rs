//! Deterministic computation-graph engine with content-addressed result
//! caching.
//!
//! Workflows are described as named *steps* with typed inputs; inputs may be
//! primitives, containers, or other steps. The engine:
//! - derives a stable fingerprint for every step from its class, version, and
//!   input closure (non-deterministic steps get fresh per-process ids)
//! - resolves a declarative config tree into a DAG, with forward references
//!   and cycle detection
//! - memoizes results in fingerprint-keyed caches, so re-running a workflow
//!   reuses everything whose inputs are semantically unchanged
//!
//! Evaluation is sequential and demand-driven. The directory-backed cache and
//! the default on-disk format live in the `trellis-cache` crate.

mod cache;
mod error;
mod fingerprint;
mod format;
mod registry;
mod resolver;
mod step;
mod value;

pub use cache::{default_step_cache, MemoryStepCache, StepCache};
pub use error::StepError;
pub use fingerprint::Fingerprint;
pub use format::Format;
pub use registry::{StepRegistry, REF_STEP_TAG};
pub use resolver::{execute_graph, resolve_step_graph};
pub use step::{
    Input, ParamSpec, RunContext, RunFn, Step, StepDefinition, StepOptions, StepOutput,
};
pub use value::{Value, ValueKind};
