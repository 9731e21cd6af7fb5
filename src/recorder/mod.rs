// src/recorder/mod.rs
//! Durable capture of one request into one artifact.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{CaptureError, CaptureResult, Sample, filename_stamp};

pub mod buffer;
pub mod high_speed;
pub mod recorder;

pub use buffer::RecordingBuffer;
pub use high_speed::HighSpeedRequest;
pub use recorder::{Recorder, spawn_recording};

pub const DEFAULT_FLUSH_INTERVAL: f64 = 1.0;
pub const MIN_FLUSH_INTERVAL: f64 = 0.1;
/// Relative deviation above which a rate counts as snapped by the hardware.
pub const RATE_SNAP_THRESHOLD: f64 = 0.10;
/// Consecutive overflow events that end a capture early.
pub const MAX_CONSECUTIVE_OVERFLOWS: u32 = 3;

/// Wire form of a recording request. Everything is optional here,
/// [`RecordingRequest::from_params`] decides what is acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingParams {
    pub freq: Option<f64>,
    pub rate: Option<f64>,
    pub gain: Option<f64>,
    pub duration: Option<f64>,
    pub channel: Option<usize>,
    #[serde(alias = "bw")]
    pub bandwidth: Option<f64>,
    pub filename: Option<String>,
    pub flush_interval: Option<f64>,
    pub chunk_samples: Option<usize>,
    pub compression: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingRequest {
    pub freq: f64,
    pub rate: f64,
    pub gain: f64,
    pub duration: f64,
    pub channel: usize,
    pub bandwidth: Option<f64>,
    pub filename: Option<PathBuf>,
    pub flush_interval: Duration,
}

impl RecordingRequest {
    /// Fails with `MissingParameter` naming every absent required field.
    pub fn from_params(params: &RecordingParams) -> CaptureResult<Self> {
        Self::from_params_with(params, DEFAULT_FLUSH_INTERVAL, MIN_FLUSH_INTERVAL)
    }

    pub(crate) fn from_params_with(
        params: &RecordingParams,
        default_flush: f64,
        min_flush: f64,
    ) -> CaptureResult<Self> {
        let missing: Vec<&str> = [
            ("freq", params.freq.is_none()),
            ("rate", params.rate.is_none()),
            ("gain", params.gain.is_none()),
            ("duration", params.duration.is_none()),
        ]
        .iter()
        .filter(|(_, absent)| *absent)
        .map(|(name, _)| *name)
        .collect();

        let (Some(freq), Some(rate), Some(gain), Some(duration)) =
            (params.freq, params.rate, params.gain, params.duration)
        else {
            return Err(CaptureError::MissingParameter {
                fields: missing.join(", "),
            });
        };

        let flush = params
            .flush_interval
            .filter(|f| f.is_finite())
            .unwrap_or(default_flush)
            .max(min_flush);

        Ok(Self {
            freq,
            rate,
            gain,
            duration,
            channel: params.channel.unwrap_or(0),
            bandwidth: params.bandwidth,
            filename: params
                .filename
                .as_ref()
                .filter(|f| !f.is_empty())
                .map(PathBuf::from),
            flush_interval: Duration::from_secs_f64(flush),
        })
    }

    /// `rf_record_{MHz}MHz_{kHz}kHz_{stamp}.rfc`
    pub fn default_filename(&self) -> String {
        format!(
            "rf_record_{}MHz_{}kHz_{}.rfc",
            (self.freq / 1e6) as i64,
            (self.rate / 1e3) as i64,
            filename_stamp()
        )
    }

    pub fn filename_or_default(&self) -> PathBuf {
        self.filename
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.default_filename()))
    }

    pub fn expected_samples(&self, actual_rate: f64) -> Option<usize> {
        (self.duration > 0.0).then(|| (actual_rate * self.duration) as usize)
    }
}

/// Requested vs. hardware sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateInfo {
    pub requested_sample_rate: f64,
    pub actual_sample_rate: f64,
    pub sample_rate_rel_diff: f64,
    pub sample_rate_snapped: bool,
}

impl RateInfo {
    pub fn new(requested: f64, actual: f64) -> Self {
        let rel_diff = (actual - requested).abs() / requested.max(1e-6);
        Self {
            requested_sample_rate: requested,
            actual_sample_rate: actual,
            sample_rate_rel_diff: rel_diff,
            sample_rate_snapped: rel_diff > RATE_SNAP_THRESHOLD,
        }
    }
}

/// Running counters handed to the observer with every chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkProgress {
    pub sample_rate: f64,
    pub center_freq: f64,
    pub processed_samples: usize,
    pub expected_samples: Option<usize>,
    pub timestamp: f64,
}

/// Receives live progress of one recording. `on_complete` is called exactly
/// once per run.
pub trait RecordingObserver: Send + Sync {
    fn on_start(&self, _actual_rate: f64, _request: &RecordingRequest) {}

    fn on_chunk(&self, _chunk: &[Sample], _progress: &ChunkProgress) {}

    fn on_complete(&self, _success: bool, _payload: &Value) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Directory for the temp buffer. System temp dir when unset.
    #[serde(default)]
    pub buffer_dir: Option<PathBuf>,
    /// Keep samples in memory next to the disk buffer.
    #[serde(default = "default_true")]
    pub collect_in_memory: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_dir: None,
            collect_in_memory: true,
        }
    }
}

/// Result of one `record` call.
#[derive(Debug, Clone)]
pub struct RecordingOutcome {
    pub success: bool,
    pub validated: bool,
    pub artifact_path: Option<PathBuf>,
    pub payload: Value,
}

impl RecordingOutcome {
    pub fn failed(payload: Value) -> Self {
        Self {
            success: false,
            validated: false,
            artifact_path: None,
            payload,
        }
    }

    pub fn is_recovered(&self) -> bool {
        self.payload
            .get("recovered")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
