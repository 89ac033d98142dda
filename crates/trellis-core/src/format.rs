use std::path::Path;

use crate::error::StepError;
use crate::value::Value;

/// A pluggable serializer used when step results are written to a directory.
///
/// A format owns the layout of the payload files inside a step's cache
/// directory; the cache itself only touches its `metadata.json` commit marker.
pub trait Format: std::fmt::Debug + Send + Sync {
    /// Serialize `value` into `dir`.
    fn write(&self, value: &Value, dir: &Path) -> Result<(), StepError>;

    /// Read a previously written value back out of `dir`.
    fn read(&self, dir: &Path) -> Result<Value, StepError>;

    /// A content checksum of the serialized payload in `dir`.
    fn checksum(&self, dir: &Path) -> Result<String, StepError>;
}
