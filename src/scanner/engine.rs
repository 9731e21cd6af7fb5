// src/scanner/engine.rs
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use crate::core::lock::lock_mutex;
use crate::core::{
    CancelToken, CaptureError, CaptureResult, ComponentLogger, LogContext, Sample, WorkerLogger,
    unix_seconds_now,
};
use crate::device::simulated::tone_with_noise;
use crate::device::{DeviceController, RxSettings};
use crate::dsp::SignalProcessor;

use super::merge::{clip_to_band, downsample, downsample_ratio, merge_round};
use super::plan::{ScanPlan, compute_plan};
use super::{ScanConfig, ScanPublisher, ScanStatus, ScannerSettings, SegmentResult, SegmentUpdate};

const INSTANCE: &str = "scanner";
const FALLBACK_MIN_SAMPLES: usize = 1024;
const FALLBACK_NOISE: f32 = 0.05;

/// Snapshot of the active session.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSessionInfo {
    pub session_id: String,
    pub config: ScanConfig,
    pub plan: ScanPlan,
    pub scan_round: u64,
    pub status: ScanStatus,
    pub start_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopReport {
    pub session_id: String,
    /// `false` if the worker did not exit within the join timeout.
    pub joined: bool,
    pub status: ScanStatus,
}

struct ActiveScan {
    id: String,
    config: ScanConfig,
    plan: ScanPlan,
    scan_round: u64,
    start_time: f64,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl ActiveScan {
    fn info(&self) -> ScanSessionInfo {
        ScanSessionInfo {
            session_id: self.id.clone(),
            config: self.config.clone(),
            plan: self.plan,
            scan_round: self.scan_round,
            status: ScanStatus::Running,
            start_time: self.start_time,
        }
    }
}

struct EngineInner {
    device: Arc<dyn DeviceController>,
    processor: Arc<dyn SignalProcessor>,
    publisher: Option<Arc<dyn ScanPublisher>>,
    settings: ScannerSettings,
    state: Mutex<Option<ActiveScan>>,
}

/// Signals the stopping thread once the worker is gone, panics included.
struct WorkerExit(Sender<()>);

impl Drop for WorkerExit {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

/// Owns at most one sweep session at a time.
pub struct ScanEngine {
    inner: Arc<EngineInner>,
}

impl ScanEngine {
    pub fn new(
        device: Arc<dyn DeviceController>,
        processor: Arc<dyn SignalProcessor>,
        publisher: Option<Arc<dyn ScanPublisher>>,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                device,
                processor,
                publisher,
                settings,
                state: Mutex::new(None),
            }),
        }
    }

    /// Starts a sweep on a dedicated worker thread and returns its session
    /// id immediately.
    pub fn start_scanning(&self, mut config: ScanConfig) -> CaptureResult<String> {
        if let Some(active) = lock_mutex(&self.inner.state, "ScanEngine::start_scanning").as_ref() {
            return Err(CaptureError::AlreadyRunning {
                session_id: active.id.clone(),
            });
        }
        if !self.inner.device.is_connected() {
            return Err(CaptureError::DeviceUnavailable {
                message: "device not connected".to_string(),
            });
        }
        validate_band(&config)?;
        if config.max_segments == 0 {
            config.max_segments = self.inner.settings.max_segments;
        }

        let supported = self.inner.device.supported_sample_rates();
        let (resolved, plan) = compute_plan(&config, supported.as_deref());

        let session_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancelToken::new();
        let (done_tx, done_rx) = channel::bounded(1);

        let mut state = lock_mutex(&self.inner.state, "ScanEngine::start_scanning");
        // zweiter Check, das Lock war zwischendurch frei
        if let Some(active) = state.as_ref() {
            return Err(CaptureError::AlreadyRunning {
                session_id: active.id.clone(),
            });
        }

        if let Some(publisher) = &self.inner.publisher {
            publisher.begin(&session_id);
        }

        let inner = self.inner.clone();
        let worker_id = session_id.clone();
        let worker_cancel = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("scan-worker".to_string())
            .spawn(move || run_worker(inner, worker_id, worker_cancel, WorkerExit(done_tx)))
            .map_err(|e| CaptureError::with_context("failed to spawn scan worker", e))?;

        self.info(&format!(
            "Scan {} started: {:.3}-{:.3} MHz, {} segments, step {:.0} Hz, rate {:.0}, fft {}",
            session_id,
            resolved.start_freq / 1e6,
            resolved.stop_freq / 1e6,
            plan.num_segments,
            plan.step_size,
            plan.sample_rate,
            plan.fft_size
        ));

        *state = Some(ActiveScan {
            id: session_id.clone(),
            config: resolved,
            plan,
            scan_round: 0,
            start_time: unix_seconds_now(),
            cancel,
            worker: Some(handle),
            done: done_rx,
        });
        Ok(session_id)
    }

    /// Cancels the active sweep and waits up to the join timeout for the
    /// worker. Returns `None` when nothing was running.
    pub fn stop_scanning(&self) -> Option<StopReport> {
        let (session_id, cancel, done, worker) = {
            let mut state = lock_mutex(&self.inner.state, "ScanEngine::stop_scanning");
            let active = state.as_mut()?;
            (
                active.id.clone(),
                active.cancel.clone(),
                active.done.clone(),
                active.worker.take(),
            )
        };

        cancel.cancel();
        let timeout = self.inner.settings.join_timeout();
        let joined = match done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = worker {
                    if handle.join().is_err() {
                        self.error(&format!("Scan worker {} panicked", session_id));
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                self.warn(&format!(
                    "Scan worker {} did not exit within {:?}, detaching",
                    session_id, timeout
                ));
                false
            }
        };

        {
            let mut state = lock_mutex(&self.inner.state, "ScanEngine::stop_scanning");
            if state.as_ref().is_some_and(|active| active.id == session_id) {
                *state = None;
            }
        }

        if let Some(publisher) = &self.inner.publisher {
            publisher.finalize(&session_id, ScanStatus::Stopped);
        }
        self.info(&format!("Scan {} stopped", session_id));

        Some(StopReport {
            session_id,
            joined,
            status: ScanStatus::Stopped,
        })
    }

    /// Config of the running sweep with rate and fft size resolved.
    pub fn get_active_config(&self) -> Option<ScanConfig> {
        lock_mutex(&self.inner.state, "ScanEngine::get_active_config")
            .as_ref()
            .map(|active| active.config.clone())
    }

    pub fn active_session(&self) -> Option<ScanSessionInfo> {
        lock_mutex(&self.inner.state, "ScanEngine::active_session")
            .as_ref()
            .map(ActiveScan::info)
    }

    pub fn is_scanning(&self) -> bool {
        lock_mutex(&self.inner.state, "ScanEngine::is_scanning").is_some()
    }
}

impl Drop for ScanEngine {
    fn drop(&mut self) {
        if let Some(active) = lock_mutex(&self.inner.state, "ScanEngine::drop").as_ref() {
            active.cancel.cancel();
        }
    }
}

impl ComponentLogger for ScanEngine {
    fn log_context(&self) -> LogContext {
        LogContext::new("ScanEngine", INSTANCE)
    }
}

fn validate_band(config: &ScanConfig) -> CaptureResult<()> {
    if !config.start_freq.is_finite() || !config.stop_freq.is_finite() {
        return Err(CaptureError::message("scan band must be finite"));
    }
    if config.stop_freq < config.start_freq {
        return Err(CaptureError::message(format!(
            "stop_freq {} is below start_freq {}",
            config.stop_freq, config.start_freq
        )));
    }
    if config.sample_rate <= 0.0 {
        return Err(CaptureError::message("sample_rate must be positive"));
    }
    Ok(())
}

fn run_worker(inner: Arc<EngineInner>, session_id: String, cancel: CancelToken, _exit: WorkerExit) {
    let logger = WorkerLogger::for_session("ScanEngine", INSTANCE, &session_id);
    let mut rng = rand::thread_rng();
    let mut round: u64 = 0;

    while !cancel.is_cancelled() {
        round += 1;
        let Some((mut config, mut plan)) = inner.begin_round(&session_id, round) else {
            break;
        };

        let segments = inner.scan_round(
            &session_id,
            round,
            &mut config,
            &mut plan,
            &cancel,
            &logger,
            &mut rng,
        );
        if cancel.is_cancelled() {
            break;
        }

        let merged = merge_round(round, &segments);
        logger.debug(&format!(
            "Round {} merged: {} segments, {} points",
            round,
            merged.segment_count,
            merged.frequencies.len()
        ));
        if let Some(publisher) = &inner.publisher {
            publisher.publish_round(&session_id, &merged);
        }

        if !config.continuous {
            inner.complete(&session_id, &cancel, &logger);
            break;
        }
        let interval = Duration::from_secs_f64(config.scan_interval.max(0.0));
        if cancel.wait_timeout(interval) {
            break;
        }
    }
    logger.debug("Scan worker exiting");
}

impl EngineInner {
    /// Bumps the round counter and hands out a snapshot of the session.
    fn begin_round(&self, session_id: &str, round: u64) -> Option<(ScanConfig, ScanPlan)> {
        let mut state = lock_mutex(&self.state, "ScanEngine::begin_round");
        let active = state.as_mut().filter(|a| a.id == session_id)?;
        active.scan_round = round;
        Some((active.config.clone(), active.plan))
    }

    fn store_plan(&self, session_id: &str, config: &ScanConfig, plan: ScanPlan) {
        let mut state = lock_mutex(&self.state, "ScanEngine::store_plan");
        if let Some(active) = state.as_mut().filter(|a| a.id == session_id) {
            active.config = config.clone();
            active.plan = plan;
        }
    }

    /// Natural end of a non-continuous scan. A concurrent stop wins.
    fn complete(&self, session_id: &str, cancel: &CancelToken, logger: &WorkerLogger) {
        let finished = {
            let mut state = lock_mutex(&self.state, "ScanEngine::complete");
            let owned = state.as_ref().is_some_and(|a| a.id == session_id);
            if owned && !cancel.is_cancelled() {
                // eigener Thread, Handle nur verwerfen
                state.take()
            } else {
                None
            }
        };

        if finished.is_some() {
            if let Some(publisher) = &self.publisher {
                publisher.finalize(session_id, ScanStatus::Completed);
            }
            logger.info("Scan completed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_round(
        &self,
        session_id: &str,
        round: u64,
        config: &mut ScanConfig,
        plan: &mut ScanPlan,
        cancel: &CancelToken,
        logger: &WorkerLogger,
        rng: &mut impl rand::Rng,
    ) -> Vec<SegmentResult> {
        let mut segments = Vec::with_capacity(plan.num_segments);
        let epsilon = plan.step_size * 1e-6;
        let mut center = config.start_freq;
        let mut index = 0usize;

        while center <= config.stop_freq + epsilon && !cancel.is_cancelled() {
            match self.scan_segment(session_id, index, center, config, plan, cancel, rng) {
                Ok(Some(segment)) => {
                    let total = plan.num_segments.max(index + 1);
                    // nach stop nichts mehr veroeffentlichen
                    if let Some(publisher) = self
                        .publisher
                        .as_ref()
                        .filter(|_| !cancel.is_cancelled())
                    {
                        publisher.publish_segment(&SegmentUpdate {
                            session_id: session_id.to_string(),
                            round,
                            current_center_freq: segment.center_freq,
                            segment: segment.clone(),
                            segments_total: total,
                            progress: (index + 1) as f64 / total as f64,
                            fft_size: plan.fft_size,
                            sample_rate: plan.sample_rate,
                            max_segments: plan.max_segments,
                        });
                    }
                    segments.push(segment);
                }
                Ok(None) => break,
                Err(e) => logger.warn(&format!(
                    "Segment {} at {:.3} MHz failed, skipping: {}",
                    index,
                    center / 1e6,
                    e
                )),
            }

            if plan.step_size <= 0.0 {
                break;
            }
            center += plan.step_size;
            index += 1;
        }
        segments
    }

    /// `Ok(None)` when cancelled during settle.
    #[allow(clippy::too_many_arguments)]
    fn scan_segment(
        &self,
        session_id: &str,
        index: usize,
        center: f64,
        config: &mut ScanConfig,
        plan: &mut ScanPlan,
        cancel: &CancelToken,
        rng: &mut impl rand::Rng,
    ) -> CaptureResult<Option<SegmentResult>> {
        let settings = RxSettings {
            freq: center,
            rate: plan.sample_rate,
            gain: self.settings.rx_gain,
            channel: self.settings.rx_channel,
            bandwidth: None,
        };
        match self.device.configure_rx(&settings) {
            Ok(actual) => {
                if plan.resync(config, actual) {
                    log::info!(
                        "scan {} resynced to hardware rate {:.0}: step {:.0}, {} segments",
                        session_id,
                        actual,
                        plan.step_size,
                        plan.num_segments
                    );
                    self.store_plan(session_id, config, *plan);
                }
            }
            Err(e) => log::warn!(
                "scan {}: configure_rx at {:.3} MHz failed, keeping {:.0} sps: {}",
                session_id,
                center / 1e6,
                plan.sample_rate,
                e
            ),
        }

        if cancel.wait_timeout(self.settings.settle()) {
            return Ok(None);
        }

        let rate = plan.sample_rate;
        let samples = self.acquire(center, rate, config.dwell_time, cancel, rng);
        let spectrum = self
            .processor
            .calculate_spectrum_sized(&samples, rate, plan.fft_size)?;

        let mut power = spectrum.power_db();
        let mut frequencies: Vec<f64> = spectrum.frequencies.iter().map(|f| f + center).collect();

        let ratio = downsample_ratio(frequencies.len(), plan.fft_size, config.span());
        downsample(&mut frequencies, &mut power, ratio);
        clip_to_band(&mut frequencies, &mut power, config.start_freq, config.stop_freq);

        Ok(Some(SegmentResult {
            segment_index: index,
            center_freq: center.clamp(config.start_freq, config.stop_freq),
            frequencies,
            power,
            timestamp: unix_seconds_now(),
        }))
    }

    /// Device samples, or a synthetic tone when the device delivers nothing.
    fn acquire(
        &self,
        center: f64,
        rate: f64,
        dwell_time: f64,
        cancel: &CancelToken,
        rng: &mut impl rand::Rng,
    ) -> Vec<Sample> {
        let channel = self.settings.rx_channel;
        match self.device.record_samples(
            dwell_time,
            channel,
            &mut |_| ControlFlow::Continue(()),
            cancel,
            true,
        ) {
            Ok(acquisition) if !acquisition.samples.is_empty() => return acquisition.samples,
            Ok(_) => log::debug!("no samples at {:.3} MHz, synthesizing", center / 1e6),
            Err(e) => log::debug!("acquisition at {:.3} MHz failed ({}), synthesizing", center / 1e6, e),
        }

        let count = ((dwell_time * rate) as usize).max(FALLBACK_MIN_SAMPLES);
        let normalized = ((center % rate) / rate) as f32;
        tone_with_noise(count, normalized, 0, FALLBACK_NOISE, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimulatedDevice, SimulatedDeviceConfig};
    use crate::dsp::FftProcessor;
    use crate::scanner::MergedRound;
    use std::time::Instant;

    #[derive(Default)]
    struct Collect {
        segments: Mutex<Vec<SegmentUpdate>>,
        rounds: Mutex<Vec<u64>>,
        finals: Mutex<Vec<ScanStatus>>,
    }

    impl ScanPublisher for Collect {
        fn publish_segment(&self, update: &SegmentUpdate) {
            self.segments.lock().unwrap().push(update.clone());
        }

        fn publish_round(&self, _session_id: &str, round: &MergedRound) {
            self.rounds.lock().unwrap().push(round.round);
        }

        fn finalize(&self, _session_id: &str, status: ScanStatus) {
            self.finals.lock().unwrap().push(status);
        }
    }

    fn engine(publisher: Arc<Collect>) -> (ScanEngine, Arc<SimulatedDevice>) {
        let device = Arc::new(SimulatedDevice::new(SimulatedDeviceConfig::default()));
        device.connect();
        let engine = ScanEngine::new(
            device.clone(),
            Arc::new(FftProcessor::with_fft_size(1024)),
            Some(publisher),
            ScannerSettings {
                settle_ms: 1,
                ..Default::default()
            },
        );
        (engine, device)
    }

    fn small_scan(continuous: bool) -> ScanConfig {
        ScanConfig {
            start_freq: 100e6,
            stop_freq: 104e6,
            resolution: 10e3,
            dwell_time: 0.001,
            sample_rate: 2e6,
            continuous,
            max_segments: 4,
            ..Default::default()
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_single_round_completes() {
        let publisher = Arc::new(Collect::default());
        let (engine, _device) = engine(publisher.clone());

        engine.start_scanning(small_scan(false)).unwrap();
        assert!(wait_until(Duration::from_secs(10), || !engine.is_scanning()));

        let segments = publisher.segments.lock().unwrap();
        assert!(!segments.is_empty());
        let last = segments.last().unwrap();
        assert!((last.progress - 1.0).abs() < 1e-9);
        for update in segments.iter() {
            assert!(update.segment.frequencies.iter().all(|f| *f >= 100e6 && *f <= 104e6));
        }
        assert_eq!(*publisher.rounds.lock().unwrap(), vec![1]);
        assert_eq!(*publisher.finals.lock().unwrap(), vec![ScanStatus::Completed]);
    }

    #[test]
    fn test_second_start_rejected() {
        let publisher = Arc::new(Collect::default());
        let (engine, _device) = engine(publisher);

        let id = engine.start_scanning(small_scan(true)).unwrap();
        match engine.start_scanning(small_scan(true)) {
            Err(CaptureError::AlreadyRunning { session_id }) => assert_eq!(session_id, id),
            other => panic!("expected AlreadyRunning, got {:?}", other.map(|_| ())),
        }
        let report = engine.stop_scanning().unwrap();
        assert_eq!(report.session_id, id);
        assert!(report.joined);
        assert!(!engine.is_scanning());
    }

    #[test]
    fn test_disconnected_device_rejected() {
        let publisher = Arc::new(Collect::default());
        let (engine, device) = engine(publisher);
        device.disconnect();

        let err = engine.start_scanning(small_scan(false)).unwrap_err();
        assert_eq!(err.code(), "device_unavailable");
        assert!(engine.active_session().is_none());
    }

    #[test]
    fn test_inverted_band_rejected() {
        let publisher = Arc::new(Collect::default());
        let (engine, _device) = engine(publisher);
        let config = ScanConfig {
            start_freq: 110e6,
            stop_freq: 100e6,
            ..small_scan(false)
        };
        assert!(engine.start_scanning(config).is_err());
        assert!(!engine.is_scanning());
    }

    #[test]
    fn test_stop_without_session() {
        let publisher = Arc::new(Collect::default());
        let (engine, _device) = engine(publisher);
        assert!(engine.stop_scanning().is_none());
    }

    #[test]
    fn test_active_config_is_resolved() {
        let publisher = Arc::new(Collect::default());
        let (engine, _device) = engine(publisher.clone());
        engine.start_scanning(small_scan(true)).unwrap();

        let config = engine.get_active_config().unwrap();
        assert!(config.fft_size.is_some());
        assert!(config.max_segments <= 4);

        engine.stop_scanning().unwrap();
        assert!(engine.get_active_config().is_none());
        assert_eq!(publisher.finals.lock().unwrap().last(), Some(&ScanStatus::Stopped));
    }
}
