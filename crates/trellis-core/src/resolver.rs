//! Turns a mapping of step names to raw parameter trees into a resolved DAG.
//!
//! Steps may refer to each other by name before the target is defined, either
//! as a bare string in a slot that expects a non-string, or through an
//! explicit `{"type": "ref", "ref": "<name>"}` placeholder. Resolution runs a
//! two-queue fixpoint: entries that mention a step that is not resolved yet
//! are deferred and retried after the rest of the queue; a full pass without
//! progress means a cycle or a dangling reference.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cache::StepCache;
use crate::error::StepError;
use crate::registry::{StepRegistry, REF_STEP_TAG};
use crate::step::{Input, Step, StepDefinition, StepOptions};
use crate::value::{Value, ValueKind};

/// Outcome of one construction attempt: missing references are transient and
/// defer the entry, everything else aborts resolution.
enum ParseError {
    Missing(String),
    Fatal(StepError),
}

impl From<StepError> for ParseError {
    fn from(err: StepError) -> Self {
        ParseError::Fatal(err)
    }
}

/// Resolve a raw workflow config into a DAG of steps.
///
/// Each entry must be a mapping with a `type` key naming a registered class
/// (or a bare string, shorthand for a parameter-less step of that class).
/// The reserved keys `cache_results` and `produce_results` configure the
/// instance; every other key is matched against the class's parameter schema.
///
/// This is quadratic in the number of steps on purpose; workflows are
/// expected to stay in the dozens.
pub fn resolve_step_graph(
    params: &BTreeMap<String, Value>,
    registry: &StepRegistry,
) -> Result<BTreeMap<String, Arc<Step>>, StepError> {
    let mut unparsed: Vec<(String, Value)> = params
        .iter()
        .rev()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let mut deferred: Vec<(String, Value)> = Vec::new();
    let mut resolved: BTreeMap<String, Arc<Step>> = BTreeMap::new();
    let mut progress = 0_usize;

    loop {
        let Some((name, step_params)) = unparsed.pop() else {
            if deferred.is_empty() {
                break;
            }
            if progress == 0 {
                let mut names: Vec<String> =
                    deferred.into_iter().map(|(name, _)| name).collect();
                names.sort();
                return Err(StepError::UnresolvableSteps { names });
            }
            unparsed = std::mem::take(&mut deferred);
            unparsed.reverse();
            progress = 0;
            continue;
        };

        if resolved.contains_key(&name) {
            return Err(StepError::DuplicateStepName { name });
        }

        match construct_step(&name, Some(&name), &step_params, registry, &resolved) {
            Ok(step) => {
                resolved.insert(name, step);
                progress += 1;
            }
            Err(ParseError::Missing(_)) => deferred.push((name, step_params)),
            Err(ParseError::Fatal(err)) => return Err(err),
        }
    }

    warn_about_nondeterministic_dependencies(&resolved);
    Ok(resolved)
}

/// Materialize every step flagged `produce_results`, in name order.
///
/// Cacheable outputs are ensured into `cache`; uncacheable ones are run for
/// their effects and the value is dropped.
pub fn execute_graph(
    graph: &BTreeMap<String, Arc<Step>>,
    cache: &dyn StepCache,
) -> Result<(), StepError> {
    for (name, step) in graph {
        if !step.produce_results() {
            continue;
        }
        tracing::debug!(target = "trellis.core", step = %name, "materializing output step");
        if step.cache_results() {
            step.ensure_result(cache)?;
        } else {
            step.result(cache)?;
        }
    }
    Ok(())
}

fn construct_step(
    owner: &str,
    step_name: Option<&str>,
    raw: &Value,
    registry: &StepRegistry,
    resolved: &BTreeMap<String, Arc<Step>>,
) -> Result<Arc<Step>, ParseError> {
    // A bare string is shorthand for a parameter-less `{type: <string>}`.
    let mut entries = match raw {
        Value::String(tag) => {
            let mut entries = BTreeMap::new();
            entries.insert("type".to_string(), Value::String(tag.clone()));
            entries
        }
        Value::Mapping(entries) => entries.clone(),
        other => {
            return Err(ParseError::Fatal(StepError::MalformedParams {
                name: owner.to_string(),
                message: format!("expected a mapping with a `type` key, got {}", other.kind()),
            }));
        }
    };

    let type_tag = match entries.remove("type") {
        Some(Value::String(tag)) => tag,
        Some(other) => {
            return Err(ParseError::Fatal(StepError::MalformedParams {
                name: owner.to_string(),
                message: format!("the `type` key must be a string, got {}", other.kind()),
            }));
        }
        None => {
            return Err(ParseError::Fatal(StepError::MalformedParams {
                name: owner.to_string(),
                message: "missing `type` key".to_string(),
            }));
        }
    };
    let definition = registry.get(&type_tag)?;

    let cache_results = match entries.remove("cache_results") {
        None => None,
        Some(Value::Bool(choice)) => Some(choice),
        Some(_) => {
            return Err(ParseError::Fatal(StepError::InvalidCacheResults {
                name: owner.to_string(),
            }));
        }
    };
    let produce_results = match entries.remove("produce_results") {
        None => false,
        Some(Value::Bool(flag)) => flag,
        Some(other) => {
            return Err(ParseError::Fatal(StepError::MalformedParams {
                name: owner.to_string(),
                message: format!("produce_results must be a bool, got {}", other.kind()),
            }));
        }
    };

    let mut kwargs: BTreeMap<String, Input> = BTreeMap::new();
    for (key, raw_value) in &entries {
        let expected = match definition.param_spec(key) {
            Some(spec) => spec.kind(),
            None if definition.allows_extra_params() => ValueKind::Any,
            None => {
                return Err(ParseError::Fatal(StepError::UnknownParam {
                    class: type_tag.clone(),
                    param: key.clone(),
                }));
            }
        };
        let input = construct_input(owner, &definition, key, expected, raw_value, registry, resolved)?;
        kwargs.insert(key.clone(), input);
    }

    for spec in definition.params() {
        if spec.is_required() && !kwargs.contains_key(spec.name()) {
            return Err(ParseError::Fatal(StepError::MissingParam {
                class: type_tag.clone(),
                param: spec.name().to_string(),
            }));
        }
    }

    // Reference placeholders never survive resolution: they either collapse
    // to their target here, or defer until the target exists.
    if type_tag == REF_STEP_TAG {
        let target = match kwargs.get("ref") {
            Some(Input::Value(Value::String(target))) => target.clone(),
            _ => {
                return Err(ParseError::Fatal(StepError::MalformedParams {
                    name: owner.to_string(),
                    message: "`ref` must be a string naming another step".to_string(),
                }));
            }
        };
        return match resolved.get(&target) {
            Some(step) => Ok(step.clone()),
            None => Err(ParseError::Missing(target)),
        };
    }

    let step = Step::with_options(
        definition,
        kwargs,
        StepOptions {
            step_name: step_name.map(str::to_string),
            cache_results,
            format: None,
            produce_results,
        },
    )?;
    Ok(step)
}

fn construct_input(
    owner: &str,
    class: &StepDefinition,
    param: &str,
    expected: ValueKind,
    raw: &Value,
    registry: &StepRegistry,
    resolved: &BTreeMap<String, Arc<Step>>,
) -> Result<Input, ParseError> {
    match raw {
        Value::Mapping(entries) if is_step_tree(entries, registry) => {
            let step = construct_step(owner, None, raw, registry, resolved)?;
            check_return_kind(class, expected, &step)?;
            Ok(Input::Step(step))
        }
        Value::String(reference) if !expected.could_be_string() => {
            // A string where a non-string is expected is a reference to
            // another step by name.
            match resolved.get(reference) {
                Some(step) => {
                    check_return_kind(class, expected, step)?;
                    Ok(Input::Step(step.clone()))
                }
                None => Err(ParseError::Missing(reference.clone())),
            }
        }
        Value::Sequence(items) => {
            // Config formats like JSON have no set literal, so a sequence is
            // accepted for a set-typed slot and collapsed into one.
            if expected == ValueKind::Set {
                let inputs = items
                    .iter()
                    .map(|item| {
                        construct_input(
                            owner,
                            class,
                            param,
                            ValueKind::Any,
                            item,
                            registry,
                            resolved,
                        )
                    })
                    .collect::<Result<BTreeSet<_>, _>>()?;
                let plain: Option<BTreeSet<Value>> = inputs
                    .iter()
                    .map(|input| match input {
                        Input::Value(value) => Some(value.clone()),
                        _ => None,
                    })
                    .collect();
                return Ok(match plain {
                    Some(values) => Input::Value(Value::Set(values)),
                    None => Input::Set(inputs),
                });
            }
            check_value_kind(class, param, expected, ValueKind::Sequence)?;
            let inputs = items
                .iter()
                .map(|item| {
                    construct_input(owner, class, param, ValueKind::Any, item, registry, resolved)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(match plain_values(&inputs) {
                Some(values) => Input::Value(Value::Sequence(values)),
                None => Input::Sequence(inputs),
            })
        }
        Value::Set(items) => {
            check_value_kind(class, param, expected, ValueKind::Set)?;
            let inputs = items
                .iter()
                .map(|item| {
                    construct_input(owner, class, param, ValueKind::Any, item, registry, resolved)
                })
                .collect::<Result<BTreeSet<_>, _>>()?;
            let plain: Option<BTreeSet<Value>> = inputs
                .iter()
                .map(|input| match input {
                    Input::Value(value) => Some(value.clone()),
                    _ => None,
                })
                .collect();
            Ok(match plain {
                Some(values) => Input::Value(Value::Set(values)),
                None => Input::Set(inputs),
            })
        }
        Value::Mapping(entries) => {
            check_value_kind(class, param, expected, ValueKind::Mapping)?;
            let inputs = entries
                .iter()
                .map(|(key, item)| {
                    construct_input(owner, class, param, ValueKind::Any, item, registry, resolved)
                        .map(|input| (key.clone(), input))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            let plain: Option<BTreeMap<String, Value>> = inputs
                .iter()
                .map(|(key, input)| match input {
                    Input::Value(value) => Some((key.clone(), value.clone())),
                    _ => None,
                })
                .collect();
            Ok(match plain {
                Some(values) => Input::Value(Value::Mapping(values)),
                None => Input::Mapping(inputs),
            })
        }
        scalar => {
            check_value_kind(class, param, expected, scalar.kind())?;
            Ok(Input::Value(scalar.clone()))
        }
    }
}

fn plain_values(inputs: &[Input]) -> Option<Vec<Value>> {
    inputs
        .iter()
        .map(|input| match input {
            Input::Value(value) => Some(value.clone()),
            _ => None,
        })
        .collect()
}

fn is_step_tree(entries: &BTreeMap<String, Value>, registry: &StepRegistry) -> bool {
    matches!(entries.get("type"), Some(Value::String(tag)) if registry.contains(tag))
}

fn check_value_kind(
    class: &StepDefinition,
    param: &str,
    expected: ValueKind,
    actual: ValueKind,
) -> Result<(), ParseError> {
    if expected.accepts(actual) {
        Ok(())
    } else {
        Err(ParseError::Fatal(StepError::ParamType {
            class: class.class_tag().to_string(),
            param: param.to_string(),
            expected,
            actual,
        }))
    }
}

fn check_return_kind(
    class: &StepDefinition,
    expected: ValueKind,
    step: &Arc<Step>,
) -> Result<(), ParseError> {
    if expected == ValueKind::Any {
        return Ok(());
    }
    match step.definition().declared_returns() {
        None => {
            tracing::warn!(
                target = "trellis.core",
                step = %step.name(),
                class = %step.class_tag(),
                "step class has no declared return type; declaring one helps debugging"
            );
            Ok(())
        }
        Some(actual) if expected.accepts(actual) => Ok(()),
        Some(actual) => Err(ParseError::Fatal(StepError::ReturnTypeMismatch {
            name: step.name().to_string(),
            class: class.class_tag().to_string(),
            expected,
            actual,
        })),
    }
}

/// Caching a step whose inputs are not reproducible produces confusing
/// results; report the first such step, once per resolver run.
fn warn_about_nondeterministic_dependencies(resolved: &BTreeMap<String, Arc<Step>>) {
    for (name, step) in resolved {
        if !step.cache_results() {
            continue;
        }
        let nondeterministic = step
            .recursive_dependencies()
            .into_iter()
            .find(|dependency| !dependency.definition().is_deterministic());
        if let Some(dependency) = nondeterministic {
            tracing::warn!(
                target = "trellis.core",
                step = %name,
                dependency = %dependency.name(),
                "step is set to cache results, but depends on a non-deterministic step"
            );
            break;
        }
    }
}
