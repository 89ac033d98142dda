//! The step model: step classes, step instances, and the demand-driven driver.
//!
//! A *step class* ([`StepDefinition`]) bundles the registered tag, the
//! determinism/cacheability/version constants, the declared parameter schema,
//! and the run function. A *step instance* ([`Step`]) binds a class to a
//! concrete set of inputs; it owns the memoized fingerprint, the resolved
//! caching policy, and the scratch-directory guard for its `run` invocation.
//!
//! Evaluation is sequential and demand-driven: [`Step::result`] materializes
//! the transitive inputs depth-first, consulting the cache before every run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use crate::cache::{default_step_cache, StepCache};
use crate::error::StepError;
use crate::fingerprint::{content_hash, random_hash, Fingerprint};
use crate::format::Format;
use crate::value::{Value, ValueKind};

/// The run function of a step class.
///
/// Run functions receive their effective inputs (embedded steps already
/// replaced by their results) and a scratch directory through the context.
pub type RunFn = Arc<dyn Fn(&RunContext<'_>) -> Result<StepOutput, StepError> + Send + Sync>;

/// What a run function produces: a value, or a lazy single-pass stream.
///
/// Streams are drained into an ordered sequence before the result is returned
/// or cached; a single-pass value is never handed to dependents.
pub enum StepOutput {
    Value(Value),
    Stream(Box<dyn Iterator<Item = Value> + Send>),
}

impl StepOutput {
    fn into_value(self) -> Value {
        match self {
            StepOutput::Value(value) => value,
            StepOutput::Stream(items) => Value::Sequence(items.collect()),
        }
    }
}

impl From<Value> for StepOutput {
    fn from(value: Value) -> Self {
        StepOutput::Value(value)
    }
}

impl fmt::Debug for StepOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutput::Value(value) => f.debug_tuple("Value").field(value).finish(),
            StepOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A declared parameter slot of a step class.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    name: String,
    kind: ValueKind,
    default: Option<Value>,
    required: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            required: false,
        }
    }

    pub fn with_default(name: impl Into<String>, kind: ValueKind, default: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            default: Some(default),
            required: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

/// A step class: everything shared by instances of one kind of step.
pub struct StepDefinition {
    class_tag: String,
    deterministic: bool,
    cacheable: Option<bool>,
    version: Option<String>,
    params: Vec<ParamSpec>,
    returns: Option<ValueKind>,
    accepts_extra: bool,
    format: Option<Arc<dyn Format>>,
    run: RunFn,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("class_tag", &self.class_tag)
            .field("deterministic", &self.deterministic)
            .field("cacheable", &self.cacheable)
            .field("version", &self.version)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("accepts_extra", &self.accepts_extra)
            .finish_non_exhaustive()
    }
}

impl StepDefinition {
    /// A new step class. Non-deterministic and unversioned until configured
    /// otherwise.
    pub fn new(
        class_tag: impl Into<String>,
        run: impl Fn(&RunContext<'_>) -> Result<StepOutput, StepError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            class_tag: class_tag.into(),
            deterministic: false,
            cacheable: None,
            version: None,
            params: Vec::new(),
            returns: None,
            accepts_extra: false,
            format: None,
            run: Arc::new(run),
        }
    }

    pub fn deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = Some(cacheable);
        self
    }

    /// Set the class version. Bumping it invalidates every fingerprint
    /// computed for the class. Validated on registration and instantiation.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn returns(mut self, kind: ValueKind) -> Self {
        self.returns = Some(kind);
        self
    }

    /// Accept parameters beyond the declared schema; extra keys are typed
    /// `Any`.
    pub fn accepts_extra(mut self) -> Self {
        self.accepts_extra = true;
        self
    }

    /// The format used when instances are cached to a directory. Instances
    /// may override it; path-backed caches supply a default when neither
    /// does.
    pub fn format(mut self, format: Arc<dyn Format>) -> Self {
        self.format = Some(format);
        self
    }

    pub fn class_tag(&self) -> &str {
        &self.class_tag
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    pub fn is_cacheable(&self) -> Option<bool> {
        self.cacheable
    }

    pub fn declared_version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn param_spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|spec| spec.name == name)
    }

    pub fn declared_returns(&self) -> Option<ValueKind> {
        self.returns
    }

    pub fn allows_extra_params(&self) -> bool {
        self.accepts_extra
    }

    /// Versions become part of fingerprints, so their alphabet is restricted.
    pub(crate) fn validate_version(&self) -> Result<(), StepError> {
        let Some(version) = &self.version else {
            return Ok(());
        };
        let valid = !version.is_empty() && version.bytes().all(|b| b.is_ascii_alphanumeric());
        if valid {
            Ok(())
        } else {
            Err(StepError::InvalidVersion {
                class: self.class_tag.clone(),
                version: version.clone(),
            })
        }
    }
}

/// One input slot of a step: a plain value, another step, or a container
/// mixing both.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Input {
    Value(Value),
    Step(Arc<Step>),
    Sequence(Vec<Input>),
    Set(BTreeSet<Input>),
    Mapping(BTreeMap<String, Input>),
}

impl Input {
    /// The canonical form used for fingerprinting: embedded steps are
    /// replaced by their fingerprints, containers are recursed.
    fn canonical(&self) -> Value {
        match self {
            Input::Value(value) => value.clone(),
            Input::Step(step) => Value::String(step.unique_id().as_str().to_string()),
            Input::Sequence(items) => Value::Sequence(items.iter().map(Input::canonical).collect()),
            Input::Set(items) => Value::Set(items.iter().map(Input::canonical).collect()),
            Input::Mapping(entries) => Value::Mapping(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), item.canonical()))
                    .collect(),
            ),
        }
    }

    /// One-level step discovery. Strings are plain values here, never
    /// traversed.
    fn collect_steps(&self, out: &mut BTreeSet<Arc<Step>>) {
        match self {
            Input::Value(_) => {}
            Input::Step(step) => {
                out.insert(step.clone());
            }
            Input::Sequence(items) => {
                for item in items {
                    item.collect_steps(out);
                }
            }
            Input::Set(items) => {
                for item in items {
                    item.collect_steps(out);
                }
            }
            Input::Mapping(entries) => {
                for item in entries.values() {
                    item.collect_steps(out);
                }
            }
        }
    }

    /// Replace embedded steps by their materialized results.
    fn resolve(&self, cache: &dyn StepCache) -> Result<Value, StepError> {
        match self {
            Input::Value(value) => Ok(value.clone()),
            Input::Step(step) => step.result(cache).map(|result| (*result).clone()),
            Input::Sequence(items) => Ok(Value::Sequence(
                items
                    .iter()
                    .map(|item| item.resolve(cache))
                    .collect::<Result<_, _>>()?,
            )),
            Input::Set(items) => Ok(Value::Set(
                items
                    .iter()
                    .map(|item| item.resolve(cache))
                    .collect::<Result<_, _>>()?,
            )),
            Input::Mapping(entries) => Ok(Value::Mapping(
                entries
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), item.resolve(cache)?)))
                    .collect::<Result<_, StepError>>()?,
            )),
        }
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Input::Value(value)
    }
}

impl From<Arc<Step>> for Input {
    fn from(step: Arc<Step>) -> Self {
        Input::Step(step)
    }
}

/// Optional knobs for [`Step::with_options`], mirroring the reserved
/// configuration keys.
#[derive(Debug, Default)]
pub struct StepOptions {
    /// Human-readable label; defaults to the fingerprint.
    pub step_name: Option<String>,
    /// Explicit caching choice; `None` resolves from the class constants.
    pub cache_results: Option<bool>,
    /// Per-instance serialization format override.
    pub format: Option<Arc<dyn Format>>,
    /// Marks this step as a terminal output of its workflow.
    pub produce_results: bool,
}

/// A node of the computation graph: a step class bound to concrete inputs.
pub struct Step {
    definition: Arc<StepDefinition>,
    name: String,
    kwargs: BTreeMap<String, Input>,
    cache_results: bool,
    produce_results: bool,
    format: Option<Arc<dyn Format>>,
    unique_id: OnceLock<Fingerprint>,
    // Holds the scratch directory only while run() is active; doubles as the
    // reentrancy guard.
    temp_dir_for_run: Mutex<Option<PathBuf>>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("class_tag", &self.definition.class_tag)
            .field("cache_results", &self.cache_results)
            .field("produce_results", &self.produce_results)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Step {
    pub fn new(
        definition: Arc<StepDefinition>,
        kwargs: BTreeMap<String, Input>,
    ) -> Result<Arc<Step>, StepError> {
        Self::with_options(definition, kwargs, StepOptions::default())
    }

    pub fn with_options(
        definition: Arc<StepDefinition>,
        kwargs: BTreeMap<String, Input>,
        options: StepOptions,
    ) -> Result<Arc<Step>, StepError> {
        definition.validate_version()?;
        let format = options.format.or_else(|| definition.format.clone());
        let mut step = Step {
            definition,
            name: String::new(),
            kwargs,
            cache_results: false,
            produce_results: options.produce_results,
            format,
            unique_id: OnceLock::new(),
            temp_dir_for_run: Mutex::new(None),
        };
        step.name = match options.step_name {
            Some(name) => name,
            None => step.unique_id().as_str().to_string(),
        };
        step.cache_results = resolve_cache_policy(&step.name, &step.definition, options.cache_results)?;
        Ok(Arc::new(step))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_tag(&self) -> &str {
        self.definition.class_tag()
    }

    pub fn definition(&self) -> &Arc<StepDefinition> {
        &self.definition
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Input> {
        &self.kwargs
    }

    pub fn cache_results(&self) -> bool {
        self.cache_results
    }

    pub fn produce_results(&self) -> bool {
        self.produce_results
    }

    /// The per-instance format override, if any.
    pub fn format(&self) -> Option<&Arc<dyn Format>> {
        self.format.as_ref()
    }

    /// The step's fingerprint. Computed lazily, memoized, and stable for the
    /// instance's lifetime; for non-deterministic classes it incorporates
    /// fresh randomness drawn at first call.
    pub fn unique_id(&self) -> &Fingerprint {
        self.unique_id.get_or_init(|| {
            let hash = if self.definition.deterministic {
                let canonical = Value::Mapping(
                    self.kwargs
                        .iter()
                        .map(|(key, input)| (key.clone(), input.canonical()))
                        .collect(),
                );
                content_hash(&canonical)
            } else {
                random_hash()
            };
            Fingerprint::render(
                &self.definition.class_tag,
                self.definition.version.as_deref(),
                &hash,
            )
        })
    }

    /// The steps reachable by one-level traversal of the inputs.
    pub fn dependencies(&self) -> BTreeSet<Arc<Step>> {
        let mut steps = BTreeSet::new();
        for input in self.kwargs.values() {
            input.collect_steps(&mut steps);
        }
        steps
    }

    /// The transitive closure of [`Step::dependencies`], excluding self.
    pub fn recursive_dependencies(&self) -> BTreeSet<Arc<Step>> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<Arc<Step>> = self.dependencies().into_iter().collect();
        while let Some(step) = pending.pop() {
            if !seen.insert(step.clone()) {
                continue;
            }
            pending.extend(step.dependencies());
        }
        seen
    }

    /// Materialize this step's result through `cache`.
    ///
    /// Embedded steps are materialized first (depth-first); the run gets a
    /// scratch directory for its lifetime; cacheable results are stored under
    /// the step's fingerprint before returning.
    pub fn result(&self, cache: &dyn StepCache) -> Result<Arc<Value>, StepError> {
        if cache.contains(self) {
            return cache.get(self);
        }
        let value = Arc::new(self.run_uncached(cache)?);
        if self.cache_results {
            cache.put(self, value.clone())?;
        }
        Ok(value)
    }

    /// [`Step::result`] against the process-wide default cache.
    pub fn result_default(&self) -> Result<Arc<Value>, StepError> {
        self.result(default_step_cache())
    }

    /// Make sure the result is in `cache` without returning it. Only makes
    /// sense for steps that cache their results.
    pub fn ensure_result(&self, cache: &dyn StepCache) -> Result<(), StepError> {
        if !self.cache_results {
            return Err(StepError::EnsureUncacheable {
                name: self.name.clone(),
            });
        }
        if cache.contains(self) {
            return Ok(());
        }
        let value = Arc::new(self.run_uncached(cache)?);
        cache.put(self, value)
    }

    fn run_uncached(&self, cache: &dyn StepCache) -> Result<Value, StepError> {
        let mut inputs = BTreeMap::new();
        for (key, input) in &self.kwargs {
            inputs.insert(key.clone(), input.resolve(cache)?);
        }
        // Declared defaults are filled at run time rather than stored in
        // kwargs, so they never perturb the fingerprint.
        for spec in &self.definition.params {
            if !inputs.contains_key(&spec.name) {
                if let Some(default) = &spec.default {
                    inputs.insert(spec.name.clone(), default.clone());
                }
            }
        }
        let guard = self.acquire_scratch_dir(cache)?;
        let context = RunContext {
            step: self,
            inputs: &inputs,
            temp_dir: guard.path.clone(),
        };
        let output = (self.definition.run)(&context);
        drop(guard);
        output.map(StepOutput::into_value)
    }

    /// The scratch directory, `Some` only while `run` is active.
    pub fn temp_dir(&self) -> Option<PathBuf> {
        self.temp_dir_for_run.lock().unwrap().clone()
    }

    fn acquire_scratch_dir(&self, cache: &dyn StepCache) -> Result<ScratchDirGuard<'_>, StepError> {
        let mut slot = self.temp_dir_for_run.lock().unwrap();
        if slot.is_some() {
            return Err(StepError::RunInProgress {
                name: self.name.clone(),
            });
        }
        match cache.path_for_step(self) {
            Some(step_dir) => {
                // Persistent scratch space: kept across runs for restarts, and
                // available to the format at serialization time.
                let run_dir = step_dir.join("run");
                std::fs::create_dir_all(&run_dir)?;
                *slot = Some(run_dir.clone());
                Ok(ScratchDirGuard {
                    step: self,
                    path: run_dir,
                    ephemeral: None,
                })
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix(&format!("{}-", self.unique_id()))
                    .suffix(".temp")
                    .tempdir()?;
                let path = temp.path().to_path_buf();
                *slot = Some(path.clone());
                Ok(ScratchDirGuard {
                    step: self,
                    path,
                    ephemeral: Some(temp),
                })
            }
        }
    }

    /// Walk the graph under this step, reporting each reachable step once in
    /// dependency-first order together with whether it was already cached.
    ///
    /// `already_cached` should be seeded with the fingerprints known to be in
    /// the cache; every emitted step is added to it, so walks from several
    /// roots over one DAG mark shared work as cached instead of repeating it.
    pub fn dry_run(&self, already_cached: &mut BTreeSet<Fingerprint>) -> Vec<(String, bool)> {
        let mut emitted = Vec::new();
        let mut visited = BTreeSet::new();
        self.dry_run_inner(already_cached, &mut visited, &mut emitted);
        emitted
    }

    fn dry_run_inner(
        &self,
        already_cached: &mut BTreeSet<Fingerprint>,
        visited: &mut BTreeSet<Fingerprint>,
        out: &mut Vec<(String, bool)>,
    ) {
        if !visited.insert(self.unique_id().clone()) {
            return;
        }
        for dependency in self.dependencies() {
            dependency.dry_run_inner(already_cached, visited, out);
        }
        let cached = already_cached.contains(self.unique_id());
        out.push((self.name.clone(), cached));
        already_cached.insert(self.unique_id().clone());
    }
}

impl PartialEq for Step {
    fn eq(&self, other: &Self) -> bool {
        self.unique_id() == other.unique_id()
    }
}

impl Eq for Step {}

impl PartialOrd for Step {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Step {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.unique_id().cmp(other.unique_id())
    }
}

impl Hash for Step {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_id().hash(state);
    }
}

/// Clears the scratch-dir slot on every exit path; dropping the inner
/// `TempDir` removes the ephemeral directory.
struct ScratchDirGuard<'a> {
    step: &'a Step,
    path: PathBuf,
    ephemeral: Option<tempfile::TempDir>,
}

impl Drop for ScratchDirGuard<'_> {
    fn drop(&mut self) {
        *self.step.temp_dir_for_run.lock().unwrap() = None;
        self.ephemeral.take();
    }
}

/// The view a run function gets of its invocation.
pub struct RunContext<'a> {
    step: &'a Step,
    inputs: &'a BTreeMap<String, Value>,
    temp_dir: PathBuf,
}

impl<'a> RunContext<'a> {
    pub fn step_name(&self) -> &str {
        self.step.name()
    }

    pub fn inputs(&self) -> &BTreeMap<String, Value> {
        self.inputs
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Value, StepError> {
        self.inputs.get(name).ok_or_else(|| StepError::MissingParam {
            class: self.step.class_tag().to_string(),
            param: name.to_string(),
        })
    }

    /// A scratch directory valid for the duration of this run. Ephemeral
    /// unless the cache backs this step with a filesystem location.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }
}

fn resolve_cache_policy(
    name: &str,
    definition: &StepDefinition,
    requested: Option<bool>,
) -> Result<bool, StepError> {
    match requested {
        Some(true) => {
            if definition.cacheable == Some(false) {
                return Err(StepError::NotCacheable {
                    name: name.to_string(),
                });
            }
            if !definition.deterministic {
                tracing::warn!(
                    target = "trellis.core",
                    step = %name,
                    "step is going to be cached despite not being deterministic"
                );
            }
            Ok(true)
        }
        Some(false) => Ok(false),
        None => match (definition.deterministic, definition.cacheable) {
            (_, Some(false)) => Ok(false),
            (false, None) => Ok(false),
            (true, None) => Ok(true),
            (false, Some(true)) => {
                tracing::warn!(
                    target = "trellis.core",
                    step = %name,
                    "step is set to be cacheable despite not being deterministic"
                );
                Ok(true)
            }
            (true, Some(true)) => Ok(true),
        },
    }
}
