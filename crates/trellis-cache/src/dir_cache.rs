//! The directory-backed step cache.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use trellis_core::{Format, Step, StepCache, StepError, Value};

use crate::json_gz::JsonGzFormat;

const METADATA_FILE_NAME: &str = "metadata.json";
const METADATA_TEMP_FILE_NAME: &str = "metadata.json.temp";

/// Environment variable overriding the cache root for [`DirectoryStepCache::from_env`].
pub const CACHE_DIR_ENV_VAR: &str = "TRELLIS_CACHE_DIR";

/// The commit marker written next to a step's payload.
///
/// Its presence means the payload was fully serialized. Unknown fields are
/// preserved across a read/write cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub step: String,
    pub checksum: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A cache that persists results under `<root>/<fingerprint>/`.
///
/// A weak in-memory layer collapses repeated in-process fetches without
/// re-deserializing; entries vanish as soon as the last strong reference to a
/// result drops, so the layer never grows past what callers are holding
/// anyway.
#[derive(Debug)]
pub struct DirectoryStepCache {
    root: PathBuf,
    default_format: Arc<dyn Format>,
    weak: Mutex<HashMap<String, Weak<Value>>>,
}

impl DirectoryStepCache {
    /// Open a cache rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StepError> {
        Self::with_format(root, Arc::new(JsonGzFormat::new()))
    }

    /// Open a cache with an explicit fallback format for steps that don't
    /// carry their own.
    pub fn with_format(
        root: impl AsRef<Path>,
        default_format: Arc<dyn Format>,
    ) -> Result<Self, StepError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            default_format,
            weak: Mutex::new(HashMap::new()),
        })
    }

    /// Open a cache at `default_root`, unless `TRELLIS_CACHE_DIR` overrides
    /// it.
    pub fn from_env(default_root: impl AsRef<Path>) -> Result<Self, StepError> {
        match std::env::var_os(CACHE_DIR_ENV_VAR) {
            Some(root) => Self::new(PathBuf::from(root)),
            None => Self::new(default_root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory that holds (or would hold) `step`'s payload.
    pub fn step_dir(&self, step: &Step) -> PathBuf {
        self.root.join(step.unique_id().as_str())
    }

    /// Read back the commit marker for `step`.
    pub fn read_metadata(&self, step: &Step) -> Result<StepMetadata, StepError> {
        let path = self.step_dir(step).join(METADATA_FILE_NAME);
        let file = File::open(&path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StepError::NotCached {
                    name: step.name().to_string(),
                }
            } else {
                StepError::Io(err)
            }
        })?;
        Ok(serde_json::from_reader(file)?)
    }

    fn format_for<'a>(&'a self, step: &'a Step) -> &'a Arc<dyn Format> {
        step.format().unwrap_or(&self.default_format)
    }

    fn metadata_path(&self, step: &Step) -> PathBuf {
        self.step_dir(step).join(METADATA_FILE_NAME)
    }

    fn weak_get(&self, step: &Step) -> Option<Arc<Value>> {
        let mut weak = self.weak.lock().unwrap();
        let key = step.unique_id().as_str();
        match weak.get(key) {
            Some(entry) => match entry.upgrade() {
                Some(value) => Some(value),
                None => {
                    // The last strong reference is gone; drop the dead entry.
                    weak.remove(key);
                    None
                }
            },
            None => None,
        }
    }

    fn weak_put(&self, step: &Step, value: &Arc<Value>) {
        self.weak
            .lock()
            .unwrap()
            .insert(step.unique_id().as_str().to_string(), Arc::downgrade(value));
    }
}

impl StepCache for DirectoryStepCache {
    fn contains(&self, step: &Step) -> bool {
        if self.weak_get(step).is_some() {
            return true;
        }
        self.metadata_path(step).exists()
    }

    fn get(&self, step: &Step) -> Result<Arc<Value>, StepError> {
        if let Some(value) = self.weak_get(step) {
            return Ok(value);
        }
        if !self.metadata_path(step).exists() {
            return Err(StepError::NotCached {
                name: step.name().to_string(),
            });
        }
        let value = Arc::new(self.format_for(step).read(&self.step_dir(step))?);
        self.weak_put(step, &value);
        Ok(value)
    }

    fn put(&self, step: &Step, value: Arc<Value>) -> Result<(), StepError> {
        let location = self.step_dir(step);
        fs::create_dir_all(&location)?;

        let metadata_path = location.join(METADATA_FILE_NAME);
        // A committed slot is immutable: hitting one here means either a
        // fingerprint collision or a caller writing the same step twice.
        if metadata_path.exists() {
            return Err(StepError::WouldOverwrite {
                path: metadata_path,
            });
        }
        let temp_path = location.join(METADATA_TEMP_FILE_NAME);

        let commit = (|| -> Result<(), StepError> {
            let format = self.format_for(step);
            format.write(&value, &location)?;
            let metadata = StepMetadata {
                step: step.unique_id().as_str().to_string(),
                checksum: format.checksum(&location)?,
                extra: BTreeMap::new(),
            };
            let mut file = File::create(&temp_path)?;
            serde_json::to_writer(&mut file, &metadata)?;
            file.sync_all()?;
            self.weak_put(step, &value);
            // The rename is the commit point; everything before it reads as a
            // cache miss.
            fs::rename(&temp_path, &metadata_path)?;
            Ok(())
        })();

        if let Err(err) = commit {
            if let Err(remove_err) = fs::remove_file(&temp_path) {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "trellis.cache",
                        path = %temp_path.display(),
                        error = %remove_err,
                        "failed to remove temporary metadata file after write failure"
                    );
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn path_for_step(&self, step: &Step) -> Option<PathBuf> {
        Some(self.step_dir(step))
    }

    /// Committed entries only; half-written slots don't count.
    fn len(&self) -> usize {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(METADATA_FILE_NAME).is_file())
            .count()
    }
}
