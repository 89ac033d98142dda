use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use trellis_core::{
    default_step_cache, Input, MemoryStepCache, ParamSpec, Step, StepCache, StepDefinition,
    StepError, StepOutput, Value, ValueKind,
};

fn counting_constant(tag: &str, value: i64, runs: Arc<AtomicUsize>) -> StepDefinition {
    StepDefinition::new(tag, move |_ctx| {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutput::Value(Value::Int(value)))
    })
    .deterministic(true)
    .returns(ValueKind::Int)
}

fn add_one_def(runs: Arc<AtomicUsize>) -> StepDefinition {
    StepDefinition::new("add_one", move |ctx| {
        runs.fetch_add(1, Ordering::SeqCst);
        let x = ctx
            .require("x")?
            .as_int()
            .ok_or_else(|| StepError::execution(ctx.step_name(), "x must be an int"))?;
        Ok(StepOutput::Value(Value::Int(x + 1)))
    })
    .deterministic(true)
    .param(ParamSpec::required("x", ValueKind::Int))
    .returns(ValueKind::Int)
}

fn kwargs(entries: Vec<(&str, Input)>) -> BTreeMap<String, Input> {
    entries
        .into_iter()
        .map(|(key, input)| (key.to_string(), input))
        .collect()
}

#[test]
fn linear_chain_materializes_through_the_cache() {
    let a_runs = Arc::new(AtomicUsize::new(0));
    let b_runs = Arc::new(AtomicUsize::new(0));
    let a = Step::new(
        Arc::new(counting_constant("seven", 7, a_runs.clone())),
        BTreeMap::new(),
    )
    .expect("construct a");
    let b = Step::new(
        Arc::new(add_one_def(b_runs.clone())),
        kwargs(vec![("x", Input::Step(a))]),
    )
    .expect("construct b");

    let cache = MemoryStepCache::new();
    let result = b.result(&cache).expect("materialize b");
    assert_eq!(*result, Value::Int(8));
    assert_eq!(a_runs.load(Ordering::SeqCst), 1);
    assert_eq!(b_runs.load(Ordering::SeqCst), 1);

    // Everything is cached now; a second evaluation runs nothing.
    let again = b.result(&cache).expect("materialize b again");
    assert_eq!(*again, Value::Int(8));
    assert_eq!(a_runs.load(Ordering::SeqCst), 1);
    assert_eq!(b_runs.load(Ordering::SeqCst), 1);
}

#[test]
fn uncacheable_steps_rerun_every_time() {
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_in_def = runs.clone();
    // Non-deterministic with no explicit choice resolves to not caching.
    let def = Arc::new(StepDefinition::new("flaky", move |_ctx| {
        runs_in_def.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutput::Value(Value::Int(1)))
    }));
    let step = Step::new(def, BTreeMap::new()).expect("construct step");
    assert!(!step.cache_results());

    let cache = MemoryStepCache::new();
    step.result(&cache).expect("first run");
    step.result(&cache).expect("second run");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 0);
}

#[test]
fn stream_results_are_drained_into_a_sequence() {
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_in_def = runs.clone();
    let def = Arc::new(
        StepDefinition::new("stream", move |_ctx| {
            runs_in_def.fetch_add(1, Ordering::SeqCst);
            let items = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
            Ok(StepOutput::Stream(Box::new(items.into_iter())))
        })
        .deterministic(true)
        .returns(ValueKind::Sequence),
    );
    let step = Step::new(def, BTreeMap::new()).expect("construct step");

    let cache = MemoryStepCache::new();
    let first = step.result(&cache).expect("first materialization");
    assert_eq!(
        *first,
        Value::Sequence(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
    );
    let second = step.result(&cache).expect("cached materialization");
    assert_eq!(*first, *second);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn ensure_result_requires_a_cacheable_step() {
    let def = Arc::new(StepDefinition::new("flaky", |_ctx| {
        Ok(StepOutput::Value(Value::Int(1)))
    }));
    let step = Step::new(def, BTreeMap::new()).expect("construct step");
    let cache = MemoryStepCache::new();
    let err = step.ensure_result(&cache).unwrap_err();
    assert!(matches!(err, StepError::EnsureUncacheable { .. }));
}

#[test]
fn ensure_result_populates_the_cache() {
    let runs = Arc::new(AtomicUsize::new(0));
    let step = Step::new(
        Arc::new(counting_constant("seven", 7, runs.clone())),
        BTreeMap::new(),
    )
    .expect("construct step");
    let cache = MemoryStepCache::new();
    step.ensure_result(&cache).expect("first ensure");
    step.ensure_result(&cache).expect("second ensure");
    assert!(cache.contains(&step));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn dry_run_walks_dependency_first_and_deduplicates() {
    let runs = Arc::new(AtomicUsize::new(0));
    let a = Step::new(
        Arc::new(counting_constant("base", 1, runs.clone())),
        BTreeMap::new(),
    )
    .expect("construct a");
    let b = Step::new(
        Arc::new(add_one_def(runs.clone())),
        kwargs(vec![("x", Input::Step(a.clone()))]),
    )
    .expect("construct b");
    // Diamond: d depends on b and on a directly.
    let d = Step::new(
        Arc::new(
            StepDefinition::new("sum", |ctx| {
                let lhs = ctx.require("lhs")?.as_int().unwrap_or_default();
                let rhs = ctx.require("rhs")?.as_int().unwrap_or_default();
                Ok(StepOutput::Value(Value::Int(lhs + rhs)))
            })
            .deterministic(true)
            .param(ParamSpec::required("lhs", ValueKind::Int))
            .param(ParamSpec::required("rhs", ValueKind::Int))
            .returns(ValueKind::Int),
        ),
        kwargs(vec![
            ("lhs", Input::Step(b.clone())),
            ("rhs", Input::Step(a.clone())),
        ]),
    )
    .expect("construct d");

    let mut already_cached = BTreeSet::new();
    let emitted = d.dry_run(&mut already_cached);
    let names: Vec<&str> = emitted.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(emitted.len(), 3);
    assert!(emitted.iter().all(|(_, cached)| !*cached));
    // a is emitted exactly once, before both of its dependents.
    let a_pos = names
        .iter()
        .position(|name| *name == a.name())
        .expect("a emitted");
    let b_pos = names
        .iter()
        .position(|name| *name == b.name())
        .expect("b emitted");
    assert!(a_pos < b_pos);
    assert_eq!(names.last(), Some(&d.name()));

    // A second walk over the same DAG sees everything as cached.
    let emitted_again = d.dry_run(&mut already_cached);
    assert_eq!(emitted_again.len(), 3);
    assert!(emitted_again.iter().all(|(_, cached)| *cached));
}

#[test]
fn run_is_not_reentrant() {
    let slot: Arc<OnceLock<Arc<Step>>> = Arc::new(OnceLock::new());
    let slot_in_def = slot.clone();
    let def = Arc::new(StepDefinition::new("selfish", move |_ctx| {
        let me = slot_in_def.get().cloned().expect("step registered");
        match me.result(default_step_cache()) {
            Err(StepError::RunInProgress { .. }) => {
                Ok(StepOutput::Value(Value::String("reentrancy-detected".to_string())))
            }
            Ok(_) => Err(StepError::execution("selfish", "inner run unexpectedly succeeded")),
            Err(err) => Err(err),
        }
    }));
    let step = Step::new(def, BTreeMap::new()).expect("construct step");
    slot.set(step.clone()).expect("store step");

    let result = step.result(default_step_cache()).expect("outer run");
    assert_eq!(*result, Value::String("reentrancy-detected".to_string()));
}

#[test]
fn ephemeral_scratch_dir_lives_only_during_run() {
    let observed: Arc<Mutex<Option<std::path::PathBuf>>> = Arc::new(Mutex::new(None));
    let observed_in_def = observed.clone();
    let def = Arc::new(
        StepDefinition::new("scratch", move |ctx| {
            let dir = ctx.temp_dir().to_path_buf();
            assert!(dir.is_dir());
            *observed_in_def.lock().unwrap() = Some(dir);
            Ok(StepOutput::Value(Value::Null))
        })
        .deterministic(true),
    );
    let step = Step::new(def, BTreeMap::new()).expect("construct step");

    let cache = MemoryStepCache::new();
    step.result(&cache).expect("run step");

    let dir = observed.lock().unwrap().clone().expect("dir observed");
    assert!(!dir.exists());
    assert_eq!(step.temp_dir(), None);
}
