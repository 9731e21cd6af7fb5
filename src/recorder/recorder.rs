// src/recorder/recorder.rs

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde_json::{Map, Value, json};

use super::buffer::RecordingBuffer;
use super::{
    ChunkProgress, MAX_CONSECUTIVE_OVERFLOWS, RateInfo, RecorderConfig, RecordingObserver,
    RecordingOutcome, RecordingParams, RecordingRequest,
};
use crate::core::{
    CancelToken, CaptureError, CaptureResult, ComponentLogger, LogContext, Sample, iso8601_now,
    unix_seconds_now,
};
use crate::device::{DeviceController, RxEvent, RxSettings};
use crate::dsp::{SignalProcessor, power_stats};
use crate::storage::{ArtifactStore, SignalMetadata, recovery_path};

/// Bandwidth assumed by the bandpass helper when the request names none.
const DEFAULT_BANDPASS_BW: f64 = 20e3;

/// Runs capture-to-artifact operations against one device and one store.
pub struct Recorder {
    device: Arc<dyn DeviceController>,
    store: Arc<dyn ArtifactStore>,
    processor: Arc<dyn SignalProcessor>,
    config: RecorderConfig,
}

/// State that has to survive into the recovery path.
#[derive(Default)]
struct RunState {
    actual_rate: Option<f64>,
    overflow_count: u32,
    samples: Option<Vec<Sample>>,
    target: Option<PathBuf>,
}

/// Guarantees a single `on_complete` per run.
pub(super) struct Completion<'a> {
    observer: Option<&'a dyn RecordingObserver>,
    emitted: bool,
}

impl<'a> Completion<'a> {
    pub fn new(observer: Option<&'a dyn RecordingObserver>) -> Self {
        Self {
            observer,
            emitted: false,
        }
    }

    pub fn emit(&mut self, success: bool, payload: &Value) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        if let Some(observer) = self.observer {
            observer.on_complete(success, payload);
        }
    }
}

impl Recorder {
    pub fn new(
        device: Arc<dyn DeviceController>,
        store: Arc<dyn ArtifactStore>,
        processor: Arc<dyn SignalProcessor>,
        config: RecorderConfig,
    ) -> Self {
        Self {
            device,
            store,
            processor,
            config,
        }
    }

    pub(super) fn device(&self) -> &dyn DeviceController {
        self.device.as_ref()
    }

    pub(super) fn store(&self) -> &dyn ArtifactStore {
        self.store.as_ref()
    }

    /// Validates `params` and records. Only parameter validation is returned
    /// as an error, everything after that ends up in the outcome.
    pub fn record_params(
        &self,
        params: &RecordingParams,
        observer: Option<&dyn RecordingObserver>,
        cancel: &CancelToken,
    ) -> CaptureResult<RecordingOutcome> {
        let request = RecordingRequest::from_params(params)?;
        Ok(self.record(&request, observer, cancel))
    }

    /// Fills in a bandpass sample rate when the request has none (or a
    /// non-positive one), then records.
    pub fn record_with_bandpass_sampling(
        &self,
        params: &RecordingParams,
        observer: Option<&dyn RecordingObserver>,
        cancel: &CancelToken,
    ) -> CaptureResult<RecordingOutcome> {
        let mut params = params.clone();
        let freq = params.freq.ok_or_else(|| CaptureError::MissingParameter {
            fields: "freq".into(),
        })?;

        if params.rate.is_none_or(|r| r <= 0.0) {
            let bw = params.bandwidth.unwrap_or(DEFAULT_BANDPASS_BW);
            let optimal = self.processor.calculate_bandpass_sample_rate(freq, bw);
            self.info(&format!(
                "using calculated bandpass sample rate: {:.1} kHz",
                optimal / 1e3
            ));
            params.rate = Some(optimal);
        }

        self.record_params(&params, observer, cancel)
    }

    /// One capture-to-artifact run. Never panics on device or storage
    /// failures; those become a failed (possibly recovered) outcome.
    pub fn record(
        &self,
        request: &RecordingRequest,
        observer: Option<&dyn RecordingObserver>,
        cancel: &CancelToken,
    ) -> RecordingOutcome {
        let mut completion = Completion::new(observer);
        let mut buffer = RecordingBuffer::open(
            self.config.buffer_dir.as_deref(),
            self.config.collect_in_memory,
            request.flush_interval,
        );
        let mut state = RunState::default();

        self.info(&format!(
            "starting recording: {:.3} MHz @ {:.1} kHz for {:.2}s",
            request.freq / 1e6,
            request.rate / 1e3,
            request.duration
        ));

        match self.capture_and_commit(request, &mut buffer, &mut state, observer, cancel) {
            Ok(outcome) => {
                // Artefakt ist committed (oder es gab nichts zu sichern)
                buffer.discard();
                completion.emit(outcome.success, &outcome.payload);
                outcome
            }
            Err(err) => {
                let outcome = self.recover(request, err, buffer, state);
                completion.emit(false, &outcome.payload);
                outcome
            }
        }
    }

    fn capture_and_commit(
        &self,
        request: &RecordingRequest,
        buffer: &mut RecordingBuffer,
        state: &mut RunState,
        observer: Option<&dyn RecordingObserver>,
        cancel: &CancelToken,
    ) -> CaptureResult<RecordingOutcome> {
        let actual_rate = self.device.configure_rx(&RxSettings {
            freq: request.freq,
            rate: request.rate,
            gain: request.gain,
            channel: request.channel,
            bandwidth: request.bandwidth,
        })?;
        state.actual_rate = Some(actual_rate);

        let rate_info = RateInfo::new(request.rate, actual_rate);
        if rate_info.sample_rate_snapped {
            self.warn(&format!(
                "actual sample rate differs from requested by >10%: requested={:.3}, actual={:.3}, rel_diff={:.3}",
                rate_info.requested_sample_rate,
                rate_info.actual_sample_rate,
                rate_info.sample_rate_rel_diff
            ));
        }
        if !buffer.has_disk() {
            self.warn("recording without disk safety buffer");
        }
        if let Some(observer) = observer {
            observer.on_start(actual_rate, request);
        }

        let expected_samples = request.expected_samples(actual_rate);
        let mut processed = 0usize;
        let mut overflows = 0u32;
        let mut consecutive = 0u32;
        let mut overflow_stop = None;

        let acquisition = self.device.record_samples(
            request.duration,
            request.channel,
            &mut |event| match event {
                RxEvent::Samples(chunk) => {
                    consecutive = 0;
                    processed += chunk.len();
                    buffer.append(chunk);
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
                    log::warn!("overflow #{}: samples lost", overflows);
                    if consecutive >= MAX_CONSECUTIVE_OVERFLOWS {
                        log::warn!("{} consecutive overflows, stopping capture", consecutive);
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
        state.overflow_count = overflows.max(acquisition.overflow_count);

        // Treiber ohne Callback-Lieferung
        if processed == 0 && !acquisition.samples.is_empty() {
            buffer.append(&acquisition.samples);
        }

        let disk_buffer = buffer.has_disk();
        buffer.sync();
        let reconciled = buffer.reconcile()?;
        let samples = state.samples.insert(reconciled.samples);

        if samples.is_empty() {
            self.warn("no data recorded");
            return Ok(RecordingOutcome::failed(json!({ "error": "no_samples" })));
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            self.warn("recording cancelled, committing partial capture");
        }

        let mut metadata = SignalMetadata::new(actual_rate, request.freq, samples.len());
        metadata.timestamp = iso8601_now();
        metadata.signal_type = "complex".into();
        metadata.rf_channel = request.channel;
        metadata.gain = request.gain;
        metadata.set_extra("target_sample_rate", request.rate);
        metadata.set_extra("overflow_count", state.overflow_count);
        metadata.set_extra("recording_mode", "buffered");
        metadata.set_extra("requested_sample_rate", rate_info.requested_sample_rate);
        metadata.set_extra("actual_sample_rate", rate_info.actual_sample_rate);
        metadata.set_extra("sample_rate_rel_diff", rate_info.sample_rate_rel_diff);
        metadata.set_extra("sample_rate_snapped", rate_info.sample_rate_snapped);
        metadata.set_extra("disk_buffer", disk_buffer);
        if reconciled.from_disk_mismatch {
            metadata.set_extra("buffer_reconciled", true);
        }
        if let Some(bw) = request.bandwidth {
            metadata.set_extra("bandwidth", bw);
        }
        if let Some(expected) = expected_samples {
            metadata.set_extra("expected_samples", expected);
            metadata.set_extra("missing_samples", expected.saturating_sub(samples.len()));
        }
        if cancelled {
            metadata.set_extra("cancelled", true);
        }
        if overflow_stop.is_some() {
            metadata.set_extra("stopped_on_overflow", true);
        }

        let target = self.store.resolve(&request.filename_or_default());
        state.target = Some(target.clone());
        let path = self.store.save(samples, &metadata, &target)?;

        let validation = self.store.validate(&path, samples.len());
        if let Err(e) = &validation {
            self.warn(&format!(
                "saved file failed post-write validation, please verify manually: {}",
                e
            ));
        }

        let file_size_mb = std::fs::metadata(&path)
            .map(|m| m.len() as f64 / 1024.0 / 1024.0)
            .ok();
        let stats = power_stats(samples);

        self.info(&format!(
            "signal saved: {:?} ({} samples, {:.2}s, avg {:.1} dB, peak {:.1} dB, overflows {})",
            path,
            samples.len(),
            metadata.duration,
            stats.average_power_db,
            stats.peak_power_db,
            state.overflow_count
        ));

        let mut payload = Map::new();
        payload.insert("metadata".into(), json!(metadata));
        payload.insert("samples_count".into(), json!(samples.len()));
        payload.insert("overflow_count".into(), json!(state.overflow_count));
        payload.insert("file_path".into(), json!(path));
        payload.insert("validation_passed".into(), json!(validation.is_ok()));
        payload.insert("power_stats".into(), json!(stats));
        payload.insert("rate_info".into(), json!(rate_info));
        payload.insert("disk_buffer".into(), json!(disk_buffer));
        if let Some(size) = file_size_mb {
            payload.insert("file_size_mb".into(), json!(size));
        }
        if let Err(e) = &validation {
            payload.insert("validation_error".into(), json!(e.to_string()));
        }
        if cancelled {
            payload.insert("cancelled".into(), json!(true));
        }
        if let Some(stop) = &overflow_stop {
            payload.insert("early_stop".into(), json!(stop.to_string()));
        }

        Ok(RecordingOutcome {
            success: true,
            validated: validation.is_ok(),
            artifact_path: Some(path),
            payload: Value::Object(payload),
        })
    }

    /// Folds whatever was buffered into a `_recovered` artifact.
    fn recover(
        &self,
        request: &RecordingRequest,
        err: CaptureError,
        mut buffer: RecordingBuffer,
        mut state: RunState,
    ) -> RecordingOutcome {
        self.error(&format!("recording failed: {}", err));

        let mut payload = Map::new();
        payload.insert("error".into(), json!(err.to_string()));
        payload.insert("error_code".into(), json!(err.code()));

        buffer.sync();
        let buffered = match state.samples.take() {
            Some(samples) if !samples.is_empty() => Some(samples),
            _ => match buffer.buffered_samples() {
                Ok(samples) => Some(samples),
                Err(e) => {
                    payload.insert("buffer_read_error".into(), json!(e.to_string()));
                    None
                }
            },
        };

        let mut recovered_path = None;
        if let Some(samples) = buffered.filter(|s| !s.is_empty()) {
            payload.insert("buffer_sample_count".into(), json!(samples.len()));

            let rate = state.actual_rate.unwrap_or(request.rate);
            let mut metadata = SignalMetadata::new(rate, request.freq, samples.len());
            metadata.signal_type = "complex".into();
            metadata.rf_channel = request.channel;
            metadata.gain = request.gain;
            metadata.set_extra("target_sample_rate", request.rate);
            metadata.set_extra("recording_mode", "buffered_recovery");
            metadata.set_extra("overflow_count", state.overflow_count);
            metadata.set_extra("recovered_after_error", true);
            if let Some(bw) = request.bandwidth {
                metadata.set_extra("bandwidth", bw);
            }

            let target = state
                .target
                .take()
                .unwrap_or_else(|| self.store.resolve(&request.filename_or_default()));
            match self.store.save(&samples, &metadata, &recovery_path(&target)) {
                Ok(path) => {
                    self.info(&format!(
                        "recovered {} buffered samples into {:?}",
                        samples.len(),
                        path
                    ));
                    payload.insert("recovered_file".into(), json!(path));
                    recovered_path = Some(path);
                }
                Err(e) => {
                    self.error(&format!("recovery failed: {}", e));
                    payload.insert("recovery_error".into(), json!(e.to_string()));
                }
            }
        }

        let recovered = recovered_path.is_some();
        payload.insert("recovered".into(), json!(recovered));
        if recovered {
            buffer.discard();
        } else if let Some(path) = buffer.keep() {
            self.warn(&format!("buffered samples retained at {:?} for manual recovery", path));
            payload.insert("buffer_path".into(), json!(path));
        }

        RecordingOutcome {
            success: false,
            validated: false,
            artifact_path: recovered_path,
            payload: Value::Object(payload),
        }
    }
}

impl ComponentLogger for Recorder {
    fn log_context(&self) -> LogContext {
        LogContext::new("Recorder", "main")
    }
}

/// Runs one recording on its own worker thread.
pub fn spawn_recording(
    recorder: Arc<Recorder>,
    request: RecordingRequest,
    observer: Option<Arc<dyn RecordingObserver>>,
    cancel: CancelToken,
) -> std::io::Result<JoinHandle<RecordingOutcome>> {
    thread::Builder::new()
        .name("recorder".into())
        .spawn(move || recorder.record(&request, observer.as_deref(), &cancel))
}
