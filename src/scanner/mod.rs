//! Segmented spectrum sweeps.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod engine;
pub mod merge;
pub mod plan;

pub use engine::{ScanEngine, ScanSessionInfo, StopReport};
pub use merge::DEDUP_TOLERANCE_HZ;
pub use plan::{MAX_SEGMENTS_CAP, ScanPlan};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub start_freq: f64,
    pub stop_freq: f64,
    /// Requested frequency resolution, drives the FFT size.
    pub resolution: f64,
    pub dwell_time: f64,
    pub sample_rate: f64,
    /// Fraction of each segment shared with the next one, 0.0..=0.9.
    pub overlap: f64,
    /// Pause between rounds of a continuous scan, seconds.
    pub scan_interval: f64,
    pub continuous: bool,
    pub fft_size: Option<usize>,
    pub max_segments: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            start_freq: 88e6,
            stop_freq: 108e6,
            resolution: 100e3,
            dwell_time: 0.1,
            sample_rate: 2e6,
            overlap: 0.0,
            scan_interval: 0.0,
            continuous: true,
            fft_size: None,
            max_segments: MAX_SEGMENTS_CAP,
        }
    }
}

impl ScanConfig {
    pub fn span(&self) -> f64 {
        (self.stop_freq - self.start_freq).max(0.0)
    }

    pub fn clamped_overlap(&self) -> f64 {
        self.overlap.clamp(0.0, 0.9)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Completed,
    Stopped,
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanStatus::Running => f.write_str("running"),
            ScanStatus::Completed => f.write_str("completed"),
            ScanStatus::Stopped => f.write_str("stopped"),
        }
    }
}

/// Spectrum of one segment, shifted to absolute frequencies and clipped to
/// the scanned band.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentResult {
    pub segment_index: usize,
    pub center_freq: f64,
    /// Hz
    pub frequencies: Vec<f64>,
    /// dB
    pub power: Vec<f64>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRound {
    pub round: u64,
    pub frequencies: Vec<f64>,
    pub power: Vec<f64>,
    pub segment_count: usize,
    pub timestamp: f64,
}

/// Everything a consumer needs to render one segment as it arrives.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentUpdate {
    pub session_id: String,
    pub round: u64,
    pub segment: SegmentResult,
    pub segments_total: usize,
    /// (segment_index + 1) / segments_total
    pub progress: f64,
    pub current_center_freq: f64,
    pub fft_size: usize,
    pub sample_rate: f64,
    pub max_segments: usize,
}

/// Sink for scan results. Implementations must not block the worker.
pub trait ScanPublisher: Send + Sync {
    /// Called once per session, before the worker starts.
    fn begin(&self, _session_id: &str) {}

    fn publish_segment(&self, update: &SegmentUpdate);

    fn publish_round(&self, _session_id: &str, _round: &MergedRound) {}

    fn finalize(&self, _session_id: &str, _status: ScanStatus) {}
}

/// Engine tuning knobs that are not part of a scan request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    /// Segment budget for requests that leave `max_segments` at 0.
    pub max_segments: usize,
    pub settle_ms: u64,
    pub join_timeout_ms: u64,
    pub rx_gain: f64,
    pub rx_channel: usize,
}

impl ScannerSettings {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            max_segments: MAX_SEGMENTS_CAP,
            settle_ms: 10,
            join_timeout_ms: 5000,
            rx_gain: 30.0,
            rx_channel: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_config_defaults() {
        let config: ScanConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ScanConfig::default());
        assert_eq!(config.span(), 20e6);
        assert!(config.continuous);
        assert_eq!(config.max_segments, 20);
    }

    #[test]
    fn test_overlap_clamped() {
        let config = ScanConfig {
            overlap: 1.5,
            ..Default::default()
        };
        assert_eq!(config.clamped_overlap(), 0.9);
    }

    #[test]
    fn test_settings_from_toml() {
        let settings: ScannerSettings =
            toml::from_str("settle_ms = 25\njoin_timeout_ms = 1000").unwrap();
        assert_eq!(settings.settle(), Duration::from_millis(25));
        assert_eq!(settings.join_timeout(), Duration::from_secs(1));
        assert_eq!(settings.rx_gain, 30.0);
    }
}
