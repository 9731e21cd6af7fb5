//! Wide-band capture straight into a growable container.
//!
//! Nothing is buffered beyond one block: chunks are appended to
//! `.<name>.tmp` next to the destination and the file is renamed into place
//! once the attribute trailer is written.

use std::fs::{self, File};
use std::io::BufWriter;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde_json::{Map, Value, json};

use super::recorder::Completion;
use super::{
    ChunkProgress, MAX_CONSECUTIVE_OVERFLOWS, RateInfo, Recorder, RecordingObserver,
    RecordingOutcome, RecordingParams, RecordingRequest,
};
use crate::core::{
    CancelToken, CaptureError, CaptureResult, ComponentLogger, Sample, filename_stamp,
    iso8601_now, unix_seconds_now,
};
use crate::device::{RxEvent, RxSettings};
use crate::storage::atomic::{TempGuard, hidden_temp_path_for};
use crate::storage::container::{self, ContainerWriter};
use crate::storage::{ArtifactFormat, CONTAINER_EXTENSION, Compression, SignalMetadata};

pub const DEFAULT_HIGH_SPEED_FLUSH: f64 = 2.0;
pub const MIN_HIGH_SPEED_FLUSH: f64 = 0.5;
pub const DEFAULT_CHUNK_SAMPLES: usize = 1024 * 1024;
pub const MIN_CHUNK_SAMPLES: usize = 16_384;

const WRITE_BUFFER_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct HighSpeedRequest {
    pub request: RecordingRequest,
    /// Samples per container block.
    pub chunk_samples: usize,
    pub compression: Compression,
}

impl HighSpeedRequest {
    pub fn from_params(params: &RecordingParams) -> CaptureResult<Self> {
        let request = RecordingRequest::from_params_with(
            params,
            DEFAULT_HIGH_SPEED_FLUSH,
            MIN_HIGH_SPEED_FLUSH,
        )?;
        let chunk_samples = params
            .chunk_samples
            .unwrap_or(DEFAULT_CHUNK_SAMPLES)
            .max(MIN_CHUNK_SAMPLES);
        let compression = match params.compression.as_deref().map(str::to_ascii_lowercase) {
            None => Compression::Deflate,
            Some(c) if matches!(c.as_str(), "off" | "false") => Compression::None,
            Some(c) => c.parse()?,
        };

        Ok(Self {
            request,
            chunk_samples,
            compression,
        })
    }

    /// `rf_highspeed_{MHz}MHz_{Msps}Msps_{stamp}.rfc`
    pub fn default_filename(&self) -> String {
        format!(
            "rf_highspeed_{}MHz_{}Msps_{}.{}",
            (self.request.freq / 1e6) as i64,
            (self.request.rate / 1e6) as i64,
            filename_stamp(),
            CONTAINER_EXTENSION
        )
    }
}

impl Recorder {
    /// Streams one capture to disk without the in-memory copy. A write error
    /// stops the capture; the temp file is removed on every failure path.
    pub fn record_high_speed(
        &self,
        request: &HighSpeedRequest,
        observer: Option<&dyn RecordingObserver>,
        cancel: &CancelToken,
    ) -> RecordingOutcome {
        let mut completion = Completion::new(observer);

        let name = request
            .request
            .filename
            .clone()
            .unwrap_or_else(|| PathBuf::from(request.default_filename()));
        let mut target = self.store().resolve(&name);
        if ArtifactFormat::from_path(&target) != Some(ArtifactFormat::Container) {
            self.warn(&format!(
                "high-speed capture always writes a container, renaming {:?}",
                target
            ));
            target.set_extension(CONTAINER_EXTENSION);
        }

        self.info(&format!(
            "starting high-speed recording at {:.1} MSps (~{:.1} MB/s)",
            request.request.rate / 1e6,
            request.request.rate * 8.0 / 1e6
        ));

        let outcome = match self.stream_to_container(request, &target, observer, cancel) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.error(&format!("high-speed recording failed: {}", err));
                RecordingOutcome::failed(json!({
                    "error": err.to_string(),
                    "error_code": err.code(),
                }))
            }
        };
        completion.emit(outcome.success, &outcome.payload);
        outcome
    }

    fn stream_to_container(
        &self,
        hs: &HighSpeedRequest,
        target: &Path,
        observer: Option<&dyn RecordingObserver>,
        cancel: &CancelToken,
    ) -> CaptureResult<RecordingOutcome> {
        let request = &hs.request;
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let actual_rate = self.device().configure_rx(&RxSettings {
            freq: request.freq,
            rate: request.rate,
            gain: request.gain,
            channel: request.channel,
            bandwidth: request.bandwidth,
        })?;
        let rate_info = RateInfo::new(request.rate, actual_rate);
        if rate_info.sample_rate_snapped {
            self.warn(&format!(
                "high-speed actual sample rate differs from requested by >10%: requested={:.3}, actual={:.3}",
                rate_info.requested_sample_rate, rate_info.actual_sample_rate
            ));
        }
        if let Some(observer) = observer {
            observer.on_start(actual_rate, request);
        }

        let started = iso8601_now();
        let guard = TempGuard::new(hidden_temp_path_for(target));
        let file = File::create(guard.path())
            .map_err(|e| CaptureError::persistence(guard.path(), e.to_string()))?;
        let mut writer = ContainerWriter::new(
            BufWriter::with_capacity(WRITE_BUFFER_BYTES, file),
            hs.compression,
        )?;

        let expected_samples = request.expected_samples(actual_rate);
        let mut pending: Vec<Sample> = Vec::with_capacity(hs.chunk_samples);
        let mut write_error: Option<CaptureError> = None;
        let mut processed = 0usize;
        let mut overflows = 0u32;
        let mut consecutive = 0u32;
        let mut overflow_stop = None;
        let mut last_flush = Instant::now();

        let acquisition = self.device().record_samples(
            request.duration,
            request.channel,
            &mut |event| match event {
                RxEvent::Samples(chunk) => {
                    consecutive = 0;
                    pending.extend_from_slice(chunk);
                    processed += chunk.len();

                    if let Err(e) = drain_full_blocks(&mut writer, &mut pending, hs.chunk_samples) {
                        write_error = Some(e);
                        return ControlFlow::Break(());
                    }
                    if last_flush.elapsed() >= request.flush_interval {
                        if let Err(e) = flush_to_disk(&mut writer) {
                            write_error = Some(e);
                            return ControlFlow::Break(());
                        }
                        last_flush = Instant::now();
                    }

                    if let Some(observer) = observer {
                        observer.on_chunk(
                            chunk,
                            &ChunkProgress {
                                sample_rate: actual_rate,
                                center_freq: request.freq,
                                processed_samples: processed,
                                expected_samples,
                                timestamp: unix_seconds_now(),
                            },
                        );
                    }
                    ControlFlow::Continue(())
                }
                RxEvent::Overflow => {
                    overflows += 1;
                    consecutive += 1;
                    if consecutive >= MAX_CONSECUTIVE_OVERFLOWS {
                        log::warn!(
                            "{} consecutive overflows, stopping high-speed capture",
                            consecutive
                        );
                        overflow_stop =
                            Some(CaptureError::AcquisitionOverflow { count: consecutive });
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
            },
            cancel,
            false,
        )?;

        if let Some(e) = write_error {
            return Err(e);
        }
        if processed == 0 && !acquisition.samples.is_empty() {
            processed = acquisition.samples.len();
            pending.extend_from_slice(&acquisition.samples);
        }
        if processed == 0 {
            return Ok(RecordingOutcome::failed(json!({ "error": "no_samples" })));
        }
        writer.write_block(&pending)?;

        let overflow_count = overflows.max(acquisition.overflow_count);
        let cancelled = cancel.is_cancelled();

        let mut metadata = SignalMetadata::new(actual_rate, request.freq, processed);
        metadata.timestamp = started;
        metadata.signal_type = "complex".into();
        metadata.rf_channel = request.channel;
        metadata.gain = request.gain;
        metadata.set_extra("target_sample_rate", request.rate);
        metadata.set_extra("recording_mode", "high_speed");
        metadata.set_extra("overflow_count", overflow_count);
        metadata.set_extra("requested_sample_rate", rate_info.requested_sample_rate);
        metadata.set_extra("sample_rate_rel_diff", rate_info.sample_rate_rel_diff);
        metadata.set_extra("sample_rate_snapped", rate_info.sample_rate_snapped);
        metadata.set_extra("compression", hs.compression.to_string());
        if let Some(bw) = request.bandwidth {
            metadata.set_extra("bandwidth", bw);
        }
        if let Some(expected) = expected_samples {
            metadata.set_extra("expected_samples", expected);
        }
        if cancelled {
            metadata.set_extra("cancelled", true);
        }
        if overflow_stop.is_some() {
            metadata.set_extra("stopped_on_overflow", true);
        }

        let file = writer
            .finish(&metadata)?
            .into_inner()
            .map_err(|e| CaptureError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        guard.commit(target)?;

        let validated = match container::count_samples(target) {
            Ok(count) if count == processed => true,
            Ok(count) => {
                self.warn(&format!(
                    "high-speed validation: expected {} samples, found {}",
                    processed, count
                ));
                false
            }
            Err(e) => {
                self.warn(&format!("validation warning for {:?}: {}", target, e));
                false
            }
        };

        let file_size_mb = fs::metadata(target)
            .map(|m| m.len() as f64 / 1024.0 / 1024.0)
            .ok();
        self.info(&format!(
            "high-speed recording completed: {} samples, {} overflows, {:.1} MB",
            processed,
            overflow_count,
            file_size_mb.unwrap_or(0.0)
        ));

        let mut payload = Map::new();
        payload.insert("metadata".into(), json!(metadata));
        payload.insert("samples_count".into(), json!(processed));
        payload.insert("overflow_count".into(), json!(overflow_count));
        payload.insert("file_path".into(), json!(target));
        payload.insert("validation_passed".into(), json!(validated));
        if let Some(size) = file_size_mb {
            payload.insert("file_size_mb".into(), json!(size));
        }
        if cancelled {
            payload.insert("cancelled".into(), json!(true));
        }
        if let Some(stop) = &overflow_stop {
            payload.insert("early_stop".into(), json!(stop.to_string()));
        }

        Ok(RecordingOutcome {
            success: true,
            validated,
            artifact_path: Some(target.to_path_buf()),
            payload: Value::Object(payload),
        })
    }
}

fn drain_full_blocks(
    writer: &mut ContainerWriter<BufWriter<File>>,
    pending: &mut Vec<Sample>,
    block_len: usize,
) -> CaptureResult<()> {
    while pending.len() >= block_len {
        writer.write_block(&pending[..block_len])?;
        pending.drain(..block_len);
    }
    Ok(())
}

fn flush_to_disk(writer: &mut ContainerWriter<BufWriter<File>>) -> CaptureResult<()> {
    writer.flush()?;
    writer.get_mut().get_ref().sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RecordingParams {
        RecordingParams {
            freq: Some(2.4e9),
            rate: Some(20e6),
            gain: Some(30.0),
            duration: Some(1.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_high_speed_defaults() {
        let req = HighSpeedRequest::from_params(&params()).unwrap();
        assert_eq!(req.chunk_samples, DEFAULT_CHUNK_SAMPLES);
        assert_eq!(req.compression, Compression::Deflate);
        assert_eq!(req.request.flush_interval.as_secs_f64(), 2.0);
        assert!(req.default_filename().starts_with("rf_highspeed_2400MHz_20Msps_"));
    }

    #[test]
    fn test_high_speed_clamps() {
        let mut p = params();
        p.chunk_samples = Some(100);
        p.flush_interval = Some(0.1);
        p.compression = Some("off".into());
        let req = HighSpeedRequest::from_params(&p).unwrap();
        assert_eq!(req.chunk_samples, MIN_CHUNK_SAMPLES);
        assert_eq!(req.request.flush_interval.as_secs_f64(), 0.5);
        assert_eq!(req.compression, Compression::None);
    }

    #[test]
    fn test_unknown_compression_rejected() {
        let mut p = params();
        p.compression = Some("lzma".into());
        assert!(HighSpeedRequest::from_params(&p).is_err());
    }
}
