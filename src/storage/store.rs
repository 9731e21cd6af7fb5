use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::atomic::write_atomic;
use super::container::{self, Compression, ContainerWriter};
use super::{ArtifactFormat, ArtifactStore, SignalMetadata, binary};
use crate::core::{CaptureError, CaptureResult, ComponentLogger, LogContext, Sample};
use crate::dsp::{PowerStats, power_stats};

/// Filesystem backed artifact store.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
    compression: Compression,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub filename: String,
    pub file_size: u64,
    pub file_size_mb: f64,
    pub samples_count: usize,
    pub duration: f64,
    pub sample_rate: f64,
    pub center_freq: f64,
    pub signal_type: String,
    pub rf_channel: usize,
    pub gain: f64,
    pub power_stats: PowerStats,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            compression: Compression::Deflate,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn file_info(&self, path: &Path) -> CaptureResult<FileInfo> {
        let path = self.resolve(path);
        let (samples, metadata) = self.load(&path)?;
        let file_size = fs::metadata(&path)?.len();
        let duration = if metadata.sample_rate > 0.0 {
            samples.len() as f64 / metadata.sample_rate
        } else {
            metadata.duration
        };

        Ok(FileInfo {
            filename: path.to_string_lossy().into_owned(),
            file_size,
            file_size_mb: file_size as f64 / 1024.0 / 1024.0,
            samples_count: samples.len(),
            duration,
            sample_rate: metadata.sample_rate,
            center_freq: metadata.center_freq,
            signal_type: metadata.signal_type,
            rf_channel: metadata.rf_channel,
            gain: metadata.gain,
            power_stats: power_stats(&samples),
        })
    }

    /// All loadable captures in `dir`, sorted by file name. Unreadable files
    /// are logged and skipped.
    pub fn list_files(&self, dir: &Path) -> CaptureResult<Vec<FileInfo>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && ArtifactFormat::from_path(p).is_some())
            .collect();
        paths.sort();

        let mut infos = Vec::with_capacity(paths.len());
        for path in paths {
            match self.file_info(&path) {
                Ok(info) => infos.push(info),
                Err(e) => self.warn(&format!("skipping {:?}: {}", path, e)),
            }
        }
        Ok(infos)
    }
}

impl ArtifactStore for FileStore {
    fn resolve(&self, filename: &Path) -> PathBuf {
        let bare = filename
            .parent()
            .map(|p| p.as_os_str().is_empty())
            .unwrap_or(true);
        if bare && !filename.is_absolute() {
            self.base_dir.join(filename)
        } else {
            filename.to_path_buf()
        }
    }

    fn save(
        &self,
        samples: &[Sample],
        metadata: &SignalMetadata,
        path: &Path,
    ) -> CaptureResult<PathBuf> {
        let target = self.resolve(path);
        self.info(&format!(
            "saving {:?} ({} samples, format={})",
            target,
            samples.len(),
            target
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".into())
        ));

        match ArtifactFormat::from_path(&target) {
            Some(ArtifactFormat::Container) => {
                write_atomic(&target, |w| {
                    let mut writer = ContainerWriter::new(w, self.compression)?;
                    for block in samples.chunks(container_block_len()) {
                        writer.write_block(block)?;
                    }
                    writer.finish(metadata)?;
                    Ok(())
                })?;
            }
            Some(ArtifactFormat::Binary) => {
                write_atomic(&target, |w| binary::write_samples(w, samples))?;
                write_atomic(&binary::sidecar_path(&target), |w| {
                    binary::write_sidecar(w, metadata)
                })?;
            }
            None => {
                return Err(CaptureError::persistence(
                    &target,
                    "unsupported file extension",
                ));
            }
        }
        Ok(target)
    }

    fn load(&self, path: &Path) -> CaptureResult<(Vec<Sample>, SignalMetadata)> {
        let path = self.resolve(path);
        match ArtifactFormat::from_path(&path) {
            Some(ArtifactFormat::Container) => container::read_container(&path),
            _ => {
                let samples = binary::read_samples(&path)?;
                let metadata = binary::read_sidecar(&path, samples.len())?;
                Ok((samples, metadata))
            }
        }
    }

    fn validate(&self, path: &Path, expected_samples: usize) -> CaptureResult<()> {
        let path = self.resolve(path);
        let (samples, _) = self.load(&path)?;
        if samples.len() != expected_samples {
            self.error(&format!(
                "integrity check failed for {:?}: expected {} samples, got {}",
                path,
                expected_samples,
                samples.len()
            ));
            return Err(CaptureError::ValidationMismatch {
                path,
                expected: expected_samples,
                found: samples.len(),
            });
        }
        Ok(())
    }
}

impl ComponentLogger for FileStore {
    fn log_context(&self) -> LogContext {
        LogContext::new("FileStore", &self.base_dir.to_string_lossy())
    }
}

// 1 Mi samples per block, same as the high-speed writer default
fn container_block_len() -> usize {
    1 << 20
}
