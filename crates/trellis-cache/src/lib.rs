//! Directory-backed step cache and the default on-disk format.
//!
//! Results live under `<root>/<fingerprint>/`: the format's payload files
//! next to a `metadata.json` commit marker. The marker is written via temp
//! file + atomic rename, so a crashed write is indistinguishable from a cache
//! miss and a retry simply runs the step again.

mod dir_cache;
mod json_gz;

pub use dir_cache::{DirectoryStepCache, StepMetadata, CACHE_DIR_ENV_VAR};
pub use json_gz::JsonGzFormat;
