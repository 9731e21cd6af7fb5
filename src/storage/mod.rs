//! Persisted capture artifacts.
//!
//! Two on-disk layouts are supported: the self-describing `.rfc` container
//! and the raw binary pair (`<name>.<ext>` + `<name>.txt` sidecar). Every
//! write goes through [`atomic`] so a destination path never holds a
//! half-written file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{CaptureResult, Sample};

pub mod atomic;
pub mod binary;
pub mod container;
pub mod store;

pub use container::Compression;
pub use store::{FileInfo, FileStore};

pub const CONTAINER_EXTENSION: &str = "rfc";
pub const BINARY_EXTENSIONS: [&str; 5] = ["dat", "complex", "raw", "bin", "iq"];
pub const FILE_VERSION: &str = "1.2";

/// Scalar attribute value stored next to the fixed metadata fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Integer(v) => Some(*v as f64),
            MetaValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Best-effort typing of a sidecar value.
    pub fn parse(text: &str) -> Self {
        match text {
            "true" | "True" => return MetaValue::Bool(true),
            "false" | "False" => return MetaValue::Bool(false),
            _ => {}
        }
        if let Ok(v) = text.parse::<i64>() {
            return MetaValue::Integer(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            return MetaValue::Number(v);
        }
        MetaValue::Text(text.to_string())
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(v) => write!(f, "{v}"),
            MetaValue::Integer(v) => write!(f, "{v}"),
            MetaValue::Number(v) => write!(f, "{v:?}"),
            MetaValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Integer(v)
    }
}

impl From<u32> for MetaValue {
    fn from(v: u32) -> Self {
        MetaValue::Integer(v as i64)
    }
}

impl From<usize> for MetaValue {
    fn from(v: usize) -> Self {
        MetaValue::Integer(v as i64)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Number(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Text(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Text(v)
    }
}

pub type Extras = BTreeMap<String, MetaValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMetadata {
    pub sample_rate: f64,
    pub center_freq: f64,
    /// ISO-8601
    pub timestamp: String,
    pub duration: f64,
    pub samples_count: usize,
    pub signal_type: String,
    pub rf_channel: usize,
    pub gain: f64,
    #[serde(default)]
    pub extras: Extras,
}

impl SignalMetadata {
    pub fn new(sample_rate: f64, center_freq: f64, samples_count: usize) -> Self {
        Self {
            sample_rate,
            center_freq,
            timestamp: crate::core::iso8601_now(),
            duration: if sample_rate > 0.0 {
                samples_count as f64 / sample_rate
            } else {
                0.0
            },
            samples_count,
            signal_type: "unknown".to_string(),
            rf_channel: 0,
            gain: 0.0,
            extras: Extras::new(),
        }
    }

    pub fn set_extra(&mut self, key: &str, value: impl Into<MetaValue>) {
        self.extras.insert(key.to_string(), value.into());
    }

    pub fn extra(&self, key: &str) -> Option<&MetaValue> {
        self.extras.get(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Container,
    Binary,
}

impl ArtifactFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if ext == CONTAINER_EXTENSION {
            Some(ArtifactFormat::Container)
        } else if BINARY_EXTENSIONS.contains(&ext.as_str()) {
            Some(ArtifactFormat::Binary)
        } else {
            None
        }
    }
}

/// `<stem>_recovered.<ext>` next to `path`.
pub fn recovery_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{}_recovered.{}", stem, ext.to_string_lossy()),
        None => format!("{stem}_recovered"),
    };
    path.with_file_name(name)
}

/// Persistence seam used by the recorder and the stream analyzer.
pub trait ArtifactStore: Send + Sync {
    /// Resolves a caller supplied name against the store's base directory.
    fn resolve(&self, filename: &Path) -> PathBuf;

    /// Atomically writes samples and metadata. Returns the committed path.
    fn save(&self, samples: &[Sample], metadata: &SignalMetadata, path: &Path)
    -> CaptureResult<PathBuf>;

    fn load(&self, path: &Path) -> CaptureResult<(Vec<Sample>, SignalMetadata)>;

    /// Reloads `path` and compares the sample count.
    fn validate(&self, path: &Path, expected_samples: usize) -> CaptureResult<()>;
}
