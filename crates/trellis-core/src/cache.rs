//! Fingerprint-keyed result storage.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::StepError;
use crate::step::Step;
use crate::value::Value;

/// Maps step fingerprints to results.
///
/// Caches must tolerate concurrent readers; writers are expected to be
/// serialized by the single-threaded driver.
pub trait StepCache: Send + Sync {
    /// Whether `step`'s result is present.
    ///
    /// Generic implementation in terms of [`StepCache::get`]; implementors
    /// usually have a faster one.
    fn contains(&self, step: &Step) -> bool {
        self.get(step).is_ok()
    }

    /// Fetch a result. Fails with [`StepError::NotCached`] when absent.
    fn get(&self, step: &Step) -> Result<Arc<Value>, StepError>;

    /// Store a result.
    fn put(&self, step: &Step, value: Arc<Value>) -> Result<(), StepError>;

    /// The filesystem location backing `step`, if this cache has one.
    ///
    /// Steps run against a path-backed cache keep their scratch directory
    /// under this location across restarts.
    fn path_for_step(&self, _step: &Step) -> Option<PathBuf> {
        None
    }

    /// Number of results held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A process-local cache over a plain map.
#[derive(Debug, Default)]
pub struct MemoryStepCache {
    results: Mutex<HashMap<String, Arc<Value>>>,
}

impl MemoryStepCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StepCache for MemoryStepCache {
    fn contains(&self, step: &Step) -> bool {
        self.results
            .lock()
            .unwrap()
            .contains_key(step.unique_id().as_str())
    }

    fn get(&self, step: &Step) -> Result<Arc<Value>, StepError> {
        self.results
            .lock()
            .unwrap()
            .get(step.unique_id().as_str())
            .cloned()
            .ok_or_else(|| StepError::NotCached {
                name: step.name().to_string(),
            })
    }

    fn put(&self, step: &Step, value: Arc<Value>) -> Result<(), StepError> {
        if step.cache_results() {
            self.results
                .lock()
                .unwrap()
                .insert(step.unique_id().as_str().to_string(), value);
        } else {
            tracing::warn!(
                target = "trellis.core",
                step = %step.name(),
                "tried to cache step despite being marked as uncacheable"
            );
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.results.lock().unwrap().len()
    }
}

/// The process-wide default cache, used when no cache is passed explicitly.
///
/// Passing a cache into [`Step::result`] is the primary path; this default
/// exists so one-off evaluations don't have to construct one.
pub fn default_step_cache() -> &'static MemoryStepCache {
    static DEFAULT: OnceLock<MemoryStepCache> = OnceLock::new();
    DEFAULT.get_or_init(MemoryStepCache::new)
}
