use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::core::lock::lock_mutex;
use crate::core::{CancelToken, CaptureError, CaptureResult, Sample};
use crate::device::{Acquisition, DeviceController, RxEvent, RxSettings, TxSettings};
use crate::storage::{ArtifactStore, FileStore, SignalMetadata};

/// Device that hands out a fixed number of deterministic samples,
/// independent of the requested duration.
pub struct MockDevice {
    total_samples: usize,
    chunk_len: usize,
    actual_rate: Option<f64>,
    supported_rates: Option<Vec<f64>>,
    /// (chunks before the burst, overflow events in the burst)
    overflow_burst: Option<(usize, u32)>,
    chunk_delay: Option<Duration>,
    /// Blocks every capture up front, ignoring cancellation.
    stall: Option<Duration>,
    connected: AtomicBool,
    rx: Mutex<Option<RxSettings>>,
    samples_produced: AtomicU64,
    record_calls: AtomicU64,
}

impl MockDevice {
    pub fn new(total_samples: usize) -> Self {
        Self {
            total_samples,
            chunk_len: 1000,
            actual_rate: None,
            supported_rates: None,
            overflow_burst: None,
            chunk_delay: None,
            stall: None,
            connected: AtomicBool::new(true),
            rx: Mutex::new(None),
            samples_produced: AtomicU64::new(0),
            record_calls: AtomicU64::new(0),
        }
    }

    pub fn with_chunk_len(mut self, chunk_len: usize) -> Self {
        self.chunk_len = chunk_len.max(1);
        self
    }

    /// `configure_rx` reports `rate` regardless of the request.
    pub fn with_actual_rate(mut self, rate: f64) -> Self {
        self.actual_rate = Some(rate);
        self
    }

    pub fn with_supported_rates(mut self, rates: Vec<f64>) -> Self {
        self.supported_rates = Some(rates);
        self
    }

    pub fn with_overflows(mut self, after_chunks: usize, count: u32) -> Self {
        self.overflow_burst = Some((after_chunks, count));
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Simulates a hung driver call.
    pub fn with_stall(mut self, stall: Duration) -> Self {
        self.stall = Some(stall);
        self
    }

    pub fn disconnected(self) -> Self {
        self.connected.store(false, Ordering::SeqCst);
        self
    }

    pub fn samples_produced(&self) -> u64 {
        self.samples_produced.load(Ordering::Relaxed)
    }

    pub fn record_calls(&self) -> u64 {
        self.record_calls.load(Ordering::Relaxed)
    }

    pub fn last_rx(&self) -> Option<RxSettings> {
        lock_mutex(&self.rx, "MockDevice::last_rx").clone()
    }

    /// Sample `i` of every capture.
    pub fn sample_at(i: usize) -> Sample {
        Sample::new((i % 1000) as f32 / 1000.0, -0.5)
    }
}

impl DeviceController for MockDevice {
    fn connect(&self) -> bool {
        self.connected.store(true, Ordering::SeqCst);
        true
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn configure_rx(&self, settings: &RxSettings) -> CaptureResult<f64> {
        if !self.is_connected() {
            return Err(CaptureError::DeviceUnavailable {
                message: "mock device disconnected".into(),
            });
        }
        let actual = self.actual_rate.unwrap_or(settings.rate);
        let mut applied = settings.clone();
        applied.rate = actual;
        *lock_mutex(&self.rx, "MockDevice::configure_rx") = Some(applied);
        Ok(actual)
    }

    fn configure_tx(&self, settings: &TxSettings) -> CaptureResult<f64> {
        Ok(self.actual_rate.unwrap_or(settings.rate))
    }

    fn record_samples(
        &self,
        _duration: f64,
        _channel: usize,
        on_event: &mut dyn FnMut(RxEvent<'_>) -> ControlFlow<()>,
        cancel: &CancelToken,
        collect_samples: bool,
    ) -> CaptureResult<Acquisition> {
        self.record_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(stall) = self.stall {
            std::thread::sleep(stall);
        }
        let mut acquisition = Acquisition::default();
        let mut produced = 0usize;
        let mut chunk_index = 0usize;

        while produced < self.total_samples && !cancel.is_cancelled() {
            if let Some((after, count)) = self.overflow_burst {
                if chunk_index == after {
                    for _ in 0..count {
                        acquisition.overflow_count += 1;
                        if on_event(RxEvent::Overflow).is_break() {
                            return Ok(acquisition);
                        }
                    }
                }
            }

            let n = self.chunk_len.min(self.total_samples - produced);
            let chunk: Vec<Sample> = (produced..produced + n).map(Self::sample_at).collect();
            produced += n;
            chunk_index += 1;
            self.samples_produced.fetch_add(n as u64, Ordering::Relaxed);

            if collect_samples {
                acquisition.samples.extend_from_slice(&chunk);
            }
            if on_event(RxEvent::Samples(&chunk)).is_break() {
                break;
            }
            if let Some(delay) = self.chunk_delay {
                if cancel.wait_timeout(delay) {
                    break;
                }
            }
        }

        Ok(acquisition)
    }

    fn supported_sample_rates(&self) -> Option<Vec<f64>> {
        self.supported_rates.clone()
    }
}

/// File store whose primary commits fail. Saves to `_recovered` paths go
/// through, so the recovery path can be observed end to end.
pub struct FailingStore {
    inner: FileStore,
    failed_saves: AtomicU64,
}

impl FailingStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: FileStore::new(base_dir),
            failed_saves: AtomicU64::new(0),
        }
    }

    pub fn failed_saves(&self) -> u64 {
        self.failed_saves.load(Ordering::Relaxed)
    }
}

impl ArtifactStore for FailingStore {
    fn resolve(&self, filename: &Path) -> PathBuf {
        self.inner.resolve(filename)
    }

    fn save(
        &self,
        samples: &[Sample],
        metadata: &SignalMetadata,
        path: &Path,
    ) -> CaptureResult<PathBuf> {
        let recovered = path
            .file_stem()
            .map(|s| s.to_string_lossy().ends_with("_recovered"))
            .unwrap_or(false);
        if !recovered {
            self.failed_saves.fetch_add(1, Ordering::Relaxed);
            return Err(CaptureError::persistence(path, "simulated commit failure"));
        }
        self.inner.save(samples, metadata, path)
    }

    fn load(&self, path: &Path) -> CaptureResult<(Vec<Sample>, SignalMetadata)> {
        self.inner.load(path)
    }

    fn validate(&self, path: &Path, expected_samples: usize) -> CaptureResult<()> {
        self.inner.validate(path, expected_samples)
    }
}
