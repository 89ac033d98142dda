//! Content-addressed step identifiers.
//!
//! A fingerprint renders as `<class>[-<version>]-<hash>` where the hash is the
//! truncated SHA-256 of a canonical byte encoding of the step's inputs (with
//! embedded steps replaced by their own fingerprints), or of fresh random
//! bytes for non-deterministic steps.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::value::Value;

/// Number of hex characters kept from the full SHA-256 digest.
const HASH_CHARS: usize = 32;

/// A stable step identifier stored as `<class>[-<version>]-<hash>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub(crate) fn render(class_tag: &str, version: Option<&str>, hash: &str) -> Self {
        let mut rendered = String::with_capacity(class_tag.len() + HASH_CHARS + 8);
        rendered.push_str(class_tag);
        if let Some(version) = version {
            rendered.push('-');
            rendered.push_str(version);
        }
        rendered.push('-');
        rendered.push_str(hash);
        Self(rendered)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hash a canonicalized input tree.
///
/// The encoding tags every node with its kind, so `[1]` and `{"0": 1}` cannot
/// collide. Sets and mappings iterate in their sorted order, which makes the
/// hash insensitive to how they were populated; sequences hash in order.
pub(crate) fn content_hash(value: &Value) -> String {
    let mut encoded = Vec::with_capacity(256);
    encode_value(value, &mut encoded);
    truncated_sha256(&encoded)
}

/// Hash fresh random bits for a non-deterministic step.
///
/// If the OS entropy source fails we fall back to the clock plus a process
/// counter, which still never repeats within a process.
pub(crate) fn random_hash() -> String {
    let mut bytes = [0_u8; 32];
    if let Err(err) = getrandom::getrandom(&mut bytes) {
        static REPORTED: OnceLock<()> = OnceLock::new();
        if REPORTED.set(()).is_ok() {
            tracing::warn!(
                target = "trellis.core",
                error = %err,
                "OS entropy source failed; falling back to clock-based ids"
            );
        }
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        bytes[..16].copy_from_slice(&nanos.to_le_bytes());
        bytes[16..24].copy_from_slice(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    }
    truncated_sha256(&bytes)
}

fn truncated_sha256(bytes: &[u8]) -> String {
    let mut digest = hex::encode(Sha256::digest(bytes));
    digest.truncate(HASH_CHARS);
    digest
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(b'n'),
        Value::Bool(b) => {
            out.push(b'b');
            out.push(*b as u8);
        }
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Float(f) => {
            out.push(b'f');
            out.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        Value::String(s) => {
            out.push(b's');
            encode_len(s.len(), out);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Sequence(items) => {
            out.push(b'l');
            encode_len(items.len(), out);
            for item in items {
                encode_value(item, out);
            }
        }
        Value::Set(items) => {
            out.push(b'e');
            encode_len(items.len(), out);
            for item in items {
                encode_value(item, out);
            }
        }
        Value::Mapping(entries) => {
            out.push(b'm');
            encode_len(entries.len(), out);
            for (key, item) in entries {
                encode_len(key.len(), out);
                out.extend_from_slice(key.as_bytes());
                encode_value(item, out);
            }
        }
    }
}

fn encode_len(len: usize, out: &mut Vec<u8>) {
    out.extend_from_slice(&(len as u64).to_le_bytes());
}
