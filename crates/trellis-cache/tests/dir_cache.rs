use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use trellis_cache::{DirectoryStepCache, JsonGzFormat};
use trellis_core::{
    Format, Input, ParamSpec, Step, StepCache, StepDefinition, StepError, StepOutput, Value,
    ValueKind,
};

fn cacheable_step(tag: &str) -> Arc<Step> {
    let def = Arc::new(
        StepDefinition::new(tag, |_ctx| Ok(StepOutput::Value(Value::Int(7))))
            .deterministic(true)
            .returns(ValueKind::Int),
    );
    Step::new(def, BTreeMap::new()).expect("construct step")
}

#[test]
fn put_then_get_roundtrips_through_disk() {
    let temp = tempfile::tempdir().unwrap();
    let cache = DirectoryStepCache::new(temp.path()).expect("open cache");
    let step = cacheable_step("roundtrip");

    let value = Arc::new(Value::Sequence(vec![Value::Int(1), Value::Int(2)]));
    cache.put(&step, value.clone()).expect("store");
    assert!(cache.contains(&step));
    assert_eq!(cache.len(), 1);

    let fetched = cache.get(&step).expect("fetch");
    assert_eq!(*fetched, *value);
}

#[test]
fn repeated_gets_share_the_in_memory_value() {
    let temp = tempfile::tempdir().unwrap();
    let cache = DirectoryStepCache::new(temp.path()).expect("open cache");
    let step = cacheable_step("shared");
    cache.put(&step, Arc::new(Value::Int(7))).expect("store");

    let first = cache.get(&step).expect("first fetch");
    let second = cache.get(&step).expect("second fetch");
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn weak_entries_vanish_with_the_last_strong_reference() {
    let temp = tempfile::tempdir().unwrap();
    let cache = DirectoryStepCache::new(temp.path()).expect("open cache");
    let step = cacheable_step("weak");
    cache.put(&step, Arc::new(Value::Int(7))).expect("store");
    // The Arc passed to put is gone, so the weak layer is empty; the value
    // still comes back from disk.
    let fetched = cache.get(&step).expect("fetch from disk");
    assert_eq!(*fetched, Value::Int(7));
}

#[test]
fn committed_slots_are_never_overwritten() {
    let temp = tempfile::tempdir().unwrap();
    let cache = DirectoryStepCache::new(temp.path()).expect("open cache");
    let step = cacheable_step("immutable");
    cache.put(&step, Arc::new(Value::Int(7))).expect("store");

    let err = cache.put(&step, Arc::new(Value::Int(8))).unwrap_err();
    assert!(matches!(err, StepError::WouldOverwrite { .. }));
}

#[test]
fn a_half_written_slot_reads_as_a_miss_and_can_be_retried() {
    let temp = tempfile::tempdir().unwrap();
    let cache = DirectoryStepCache::new(temp.path()).expect("open cache");
    let step = cacheable_step("crashed");

    // Simulate a crash between the payload write and the metadata rename:
    // payload and temp marker exist, the commit marker does not.
    let slot = cache.step_dir(&step);
    fs::create_dir_all(&slot).unwrap();
    JsonGzFormat::new()
        .write(&Value::Int(7), &slot)
        .expect("write payload");
    fs::write(slot.join("metadata.json.temp"), b"{\"step\":\"partial\"}").unwrap();

    assert!(!cache.contains(&step));
    assert_eq!(cache.len(), 0);

    // A retry commits over the leftovers.
    cache.put(&step, Arc::new(Value::Int(7))).expect("retry");
    assert!(cache.contains(&step));
    assert!(slot.join("metadata.json").is_file());
    assert!(!slot.join("metadata.json.temp").exists());
}

#[test]
fn metadata_records_the_fingerprint_and_checksum() {
    let temp = tempfile::tempdir().unwrap();
    let cache = DirectoryStepCache::new(temp.path()).expect("open cache");
    let step = cacheable_step("metadata");
    cache.put(&step, Arc::new(Value::Int(7))).expect("store");

    let metadata = cache.read_metadata(&step).expect("read metadata");
    assert_eq!(metadata.step, step.unique_id().as_str());
    let checksum = JsonGzFormat::new()
        .checksum(&cache.step_dir(&step))
        .expect("checksum");
    assert_eq!(metadata.checksum, checksum);
}

#[test]
fn failed_runs_leave_no_cache_entry() {
    let temp = tempfile::tempdir().unwrap();
    let cache = DirectoryStepCache::new(temp.path()).expect("open cache");
    let def = Arc::new(
        StepDefinition::new("explode", |ctx| -> Result<StepOutput, StepError> {
            Err(StepError::execution(ctx.step_name(), "boom"))
        })
        .deterministic(true),
    );
    let step = Step::new(def, BTreeMap::new()).expect("construct step");

    let err = step.result(&cache).unwrap_err();
    assert!(matches!(err, StepError::Execution { .. }));
    assert!(!cache.contains(&step));
    assert_eq!(cache.len(), 0);
}

#[test]
fn path_backed_steps_keep_their_run_directory() {
    let temp = tempfile::tempdir().unwrap();
    let cache = DirectoryStepCache::new(temp.path()).expect("open cache");

    let observed: Arc<Mutex<Option<std::path::PathBuf>>> = Arc::new(Mutex::new(None));
    let observed_in_def = observed.clone();
    let def = Arc::new(
        StepDefinition::new("worker", move |ctx| {
            let marker = ctx.temp_dir().join("progress.txt");
            fs::write(&marker, b"halfway")?;
            *observed_in_def.lock().unwrap() = Some(marker);
            Ok(StepOutput::Value(Value::Int(1)))
        })
        .deterministic(true)
        .returns(ValueKind::Int),
    );
    let step = Step::new(def, BTreeMap::new()).expect("construct step");
    step.result(&cache).expect("run step");

    // The scratch directory survives the run for restarts.
    let marker = observed.lock().unwrap().clone().expect("marker recorded");
    let run_dir = cache.step_dir(&step).join("run");
    assert!(marker.is_file());
    assert_eq!(marker.parent(), Some(run_dir.as_path()));
    assert_eq!(step.temp_dir(), None);
}

#[test]
fn results_flow_across_cache_instances_without_reruns() {
    let temp = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let make_chain = |runs: Arc<AtomicUsize>| {
        let base_runs = runs.clone();
        let base = Arc::new(
            StepDefinition::new("seven", move |_ctx| {
                base_runs.fetch_add(1, Ordering::SeqCst);
                Ok(StepOutput::Value(Value::Int(7)))
            })
            .deterministic(true)
            .returns(ValueKind::Int),
        );
        let add_runs = runs;
        let add = Arc::new(
            StepDefinition::new("add_one", move |ctx| {
                add_runs.fetch_add(1, Ordering::SeqCst);
                let x = ctx.require("x")?.as_int().unwrap_or_default();
                Ok(StepOutput::Value(Value::Int(x + 1)))
            })
            .deterministic(true)
            .param(ParamSpec::required("x", ValueKind::Int))
            .returns(ValueKind::Int),
        );
        let a = Step::new(base, BTreeMap::new()).expect("construct a");
        Step::new(
            add,
            [("x".to_string(), Input::Step(a))].into_iter().collect(),
        )
        .expect("construct b")
    };

    // First "process": run and persist.
    {
        let cache = DirectoryStepCache::new(temp.path()).expect("open cache");
        let chain = make_chain(runs.clone());
        let result = chain.result(&cache).expect("materialize");
        assert_eq!(*result, Value::Int(8));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    // Second "process": identical definitions, fresh cache over the same
    // root. Everything is served from disk.
    {
        let cache = DirectoryStepCache::new(temp.path()).expect("open cache");
        let chain = make_chain(runs.clone());
        let result = chain.result(&cache).expect("materialize");
        assert_eq!(*result, Value::Int(8));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
