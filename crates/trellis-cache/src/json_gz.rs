//! The default on-disk format: gzip-compressed JSON.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use trellis_core::{Format, StepError, Value};

const PAYLOAD_FILE_NAME: &str = "data.json.gz";

/// Serializes a value as JSON and gzips it into a single payload file.
#[derive(Debug, Clone, Default)]
pub struct JsonGzFormat;

impl JsonGzFormat {
    pub fn new() -> Self {
        Self
    }

    fn payload_path(dir: &Path) -> std::path::PathBuf {
        dir.join(PAYLOAD_FILE_NAME)
    }
}

impl Format for JsonGzFormat {
    fn write(&self, value: &Value, dir: &Path) -> Result<(), StepError> {
        let file = File::create(Self::payload_path(dir))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        serde_json::to_writer(&mut encoder, value)?;
        encoder.finish()?.sync_all()?;
        Ok(())
    }

    fn read(&self, dir: &Path) -> Result<Value, StepError> {
        let file = File::open(Self::payload_path(dir))?;
        let decoder = GzDecoder::new(file);
        Ok(serde_json::from_reader(decoder)?)
    }

    /// Streaming SHA-256 of the payload file, hex-encoded.
    fn checksum(&self, dir: &Path) -> Result<String, StepError> {
        let mut file = File::open(Self::payload_path(dir))?;
        let mut hasher = Sha256::new();
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
