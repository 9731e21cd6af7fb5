use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, bail};

use crate::bridge::BridgeConfig;
use crate::device::SimulatedDeviceConfig;
use crate::recorder::RecorderConfig;
use crate::recorder::high_speed::{
    DEFAULT_CHUNK_SAMPLES, DEFAULT_HIGH_SPEED_FLUSH, MIN_CHUNK_SAMPLES, MIN_HIGH_SPEED_FLUSH,
};
use crate::recorder::{DEFAULT_FLUSH_INTERVAL, MIN_FLUSH_INTERVAL, RecordingParams};
use crate::scanner::{MAX_SEGMENTS_CAP, ScannerSettings};
use crate::storage::Compression;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecorderSection {
    /// Base directory for artifacts given by bare file name.
    pub output_dir: PathBuf,
    pub buffer_dir: Option<PathBuf>,
    pub collect_in_memory: bool,
    /// Seconds between fsyncs of the disk buffer.
    pub flush_interval: f64,
    pub high_speed_flush_interval: f64,
    pub chunk_samples: usize,
    pub compression: Compression,
}

impl Default for RecorderSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            buffer_dir: None,
            collect_in_memory: true,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            high_speed_flush_interval: DEFAULT_HIGH_SPEED_FLUSH,
            chunk_samples: DEFAULT_CHUNK_SAMPLES,
            compression: Compression::Deflate,
        }
    }
}

impl RecorderSection {
    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            buffer_dir: self.buffer_dir.clone(),
            collect_in_memory: self.collect_in_memory,
        }
    }

    /// Fills what the request left open from this section.
    pub fn apply_defaults(&self, params: &mut RecordingParams, high_speed: bool) {
        let flush = if high_speed {
            self.high_speed_flush_interval
        } else {
            self.flush_interval
        };
        params.flush_interval.get_or_insert(flush);
        if high_speed {
            params.chunk_samples.get_or_insert(self.chunk_samples);
            params
                .compression
                .get_or_insert_with(|| self.compression.to_string());
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            bail!("recorder.output_dir must not be empty");
        }
        if !(self.flush_interval.is_finite() && self.flush_interval >= MIN_FLUSH_INTERVAL) {
            bail!("recorder.flush_interval must be >= {}", MIN_FLUSH_INTERVAL);
        }
        if !(self.high_speed_flush_interval.is_finite()
            && self.high_speed_flush_interval >= MIN_HIGH_SPEED_FLUSH)
        {
            bail!(
                "recorder.high_speed_flush_interval must be >= {}",
                MIN_HIGH_SPEED_FLUSH
            );
        }
        if self.chunk_samples < MIN_CHUNK_SAMPLES {
            bail!("recorder.chunk_samples must be >= {}", MIN_CHUNK_SAMPLES);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub node_name: String,
    #[serde(default)]
    pub device: SimulatedDeviceConfig,
    #[serde(default)]
    pub recorder: RecorderSection,
    #[serde(default)]
    pub scanner: ScannerSettings,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl NodeConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read config {}", path))?;
        let config: Self = toml::from_str(&content)?;
        config.validate().context("config validation failed")?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.trim().is_empty() {
            bail!("node_name must not be empty");
        }

        if self.device.chunk_samples == 0 {
            bail!("device.chunk_samples must be > 0");
        }
        if self.device.sample_rates.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            bail!("device.sample_rates must be positive");
        }

        self.recorder.validate()?;

        if !(2..=MAX_SEGMENTS_CAP).contains(&self.scanner.max_segments) {
            bail!(
                "scanner.max_segments must be within 2..={}",
                MAX_SEGMENTS_CAP
            );
        }
        if self.scanner.join_timeout_ms == 0 {
            bail!("scanner.join_timeout_ms must be > 0");
        }

        if self.bridge.queue_capacity == 0 {
            bail!("bridge.queue_capacity must be > 0");
        }
        if self.bridge.chunk_size == 0 {
            bail!("bridge.chunk_size must be > 0");
        }
        if self.bridge.spectrum_fft_size == 0 {
            bail!("bridge.spectrum_fft_size must be > 0");
        }

        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "sdr-capture-node".to_string(),
            device: SimulatedDeviceConfig::default(),
            recorder: RecorderSection::default(),
            scanner: ScannerSettings::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config: NodeConfig = toml::from_str("node_name = \"lab\"").unwrap();
        config.validate().unwrap();
        assert_eq!(config.scanner.max_segments, 20);
        assert_eq!(config.bridge.queue_capacity, 1024);
        assert_eq!(config.recorder.compression, Compression::Deflate);
    }

    #[test]
    fn test_sections_parsed() {
        let config: NodeConfig = toml::from_str(
            r#"
            node_name = "lab"

            [device]
            sample_rates = [1e6, 2e6]
            chunk_samples = 2048

            [recorder]
            output_dir = "/data/rf"
            flush_interval = 0.5
            compression = "none"

            [scanner]
            max_segments = 8
            settle_ms = 5

            [bridge]
            queue_capacity = 16
            session_ack = false
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.device.sample_rates, vec![1e6, 2e6]);
        assert_eq!(config.recorder.output_dir, PathBuf::from("/data/rf"));
        assert_eq!(config.recorder.compression, Compression::None);
        assert_eq!(config.scanner.max_segments, 8);
        assert!(!config.bridge.session_ack);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = NodeConfig::default();
        config.validate().unwrap();

        config.node_name = " ".into();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.scanner.max_segments = 50;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.recorder.flush_interval = 0.0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.bridge.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_defaults_keeps_explicit_values() {
        let section = RecorderSection::default();
        let mut params = RecordingParams {
            flush_interval: Some(3.0),
            ..Default::default()
        };
        section.apply_defaults(&mut params, false);
        assert_eq!(params.flush_interval, Some(3.0));
        assert!(params.chunk_samples.is_none());

        let mut params = RecordingParams::default();
        section.apply_defaults(&mut params, true);
        assert_eq!(params.flush_interval, Some(DEFAULT_HIGH_SPEED_FLUSH));
        assert_eq!(params.chunk_samples, Some(DEFAULT_CHUNK_SAMPLES));
        assert_eq!(params.compression.as_deref(), Some("deflate"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();

        NodeConfig::default().save(path).unwrap();
        let loaded = NodeConfig::load(path).unwrap();
        assert_eq!(loaded.node_name, "sdr-capture-node");
    }
}
