use std::ops::ControlFlow;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Acquisition, DeviceController, RxEvent, RxSettings, TxSettings};
use crate::core::lock::lock_mutex;
use crate::core::{CancelToken, CaptureError, CaptureResult, ComponentLogger, LogContext, Sample};

const DEFAULT_CHUNK_SAMPLES: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedDeviceConfig {
    /// Rates the fake hardware snaps to. Empty accepts any rate.
    #[serde(default = "default_rates")]
    pub sample_rates: Vec<f64>,
    #[serde(default = "default_chunk_samples")]
    pub chunk_samples: usize,
    /// Tone offset from the tuned center frequency.
    #[serde(default = "default_tone_offset")]
    pub tone_offset_hz: f64,
    #[serde(default = "default_noise")]
    pub noise_amplitude: f32,
    /// Pace chunks at the configured sample rate instead of as fast as possible.
    #[serde(default)]
    pub realtime: bool,
}

fn default_rates() -> Vec<f64> {
    vec![250e3, 1e6, 2e6, 4e6, 5e6, 10e6, 20e6]
}

fn default_chunk_samples() -> usize {
    DEFAULT_CHUNK_SAMPLES
}

fn default_tone_offset() -> f64 {
    100e3
}

fn default_noise() -> f32 {
    0.05
}

impl Default for SimulatedDeviceConfig {
    fn default() -> Self {
        Self {
            sample_rates: default_rates(),
            chunk_samples: default_chunk_samples(),
            tone_offset_hz: default_tone_offset(),
            noise_amplitude: default_noise(),
            realtime: false,
        }
    }
}

/// Headless stand-in for the radio: a single tone plus gaussian noise.
pub struct SimulatedDevice {
    config: SimulatedDeviceConfig,
    connected: AtomicBool,
    rx: Mutex<Option<RxSettings>>,
    samples_generated: AtomicU64,
}

impl SimulatedDevice {
    pub fn new(config: SimulatedDeviceConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(true),
            rx: Mutex::new(None),
            samples_generated: AtomicU64::new(0),
        }
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn samples_generated(&self) -> u64 {
        self.samples_generated.load(Ordering::Relaxed)
    }

    fn snap_rate(&self, rate: f64) -> f64 {
        self.config
            .sample_rates
            .iter()
            .copied()
            .min_by(|a, b| (a - rate).abs().total_cmp(&(b - rate).abs()))
            .unwrap_or(rate)
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(SimulatedDeviceConfig::default())
    }
}

impl DeviceController for SimulatedDevice {
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
                message: "simulated device disconnected".into(),
            });
        }
        let actual = self.snap_rate(settings.rate);
        let mut applied = settings.clone();
        applied.rate = actual;
        *lock_mutex(&self.rx, "SimulatedDevice::configure_rx") = Some(applied);
        self.debug(&format!(
            "rx tuned to {:.3} MHz, rate {:.1} kHz (requested {:.1} kHz)",
            settings.freq / 1e6,
            actual / 1e3,
            settings.rate / 1e3
        ));
        Ok(actual)
    }

    fn configure_tx(&self, settings: &TxSettings) -> CaptureResult<f64> {
        if !self.is_connected() {
            return Err(CaptureError::DeviceUnavailable {
                message: "simulated device disconnected".into(),
            });
        }
        Ok(self.snap_rate(settings.rate))
    }

    fn record_samples(
        &self,
        duration: f64,
        _channel: usize,
        on_event: &mut dyn FnMut(RxEvent<'_>) -> ControlFlow<()>,
        cancel: &CancelToken,
        collect_samples: bool,
    ) -> CaptureResult<Acquisition> {
        let rx = lock_mutex(&self.rx, "SimulatedDevice::record_samples")
            .clone()
            .ok_or_else(|| CaptureError::device("record_samples called before configure_rx"))?;

        let total = (duration * rx.rate).max(0.0) as usize;
        let chunk_len = self.config.chunk_samples.max(1);
        let chunk_period = Duration::from_secs_f64(chunk_len as f64 / rx.rate.max(1.0));
        let normalized = (self.config.tone_offset_hz / rx.rate.max(1.0)) as f32;

        let mut acquisition = Acquisition::default();
        let mut rng = rand::thread_rng();
        let mut produced = 0usize;

        while produced < total && !cancel.is_cancelled() {
            let n = chunk_len.min(total - produced);
            let chunk = tone_with_noise(
                n,
                normalized,
                produced as u64,
                self.config.noise_amplitude,
                &mut rng,
            );
            produced += n;
            self.samples_generated.fetch_add(n as u64, Ordering::Relaxed);

            if collect_samples {
                acquisition.samples.extend_from_slice(&chunk);
            }
            if on_event(RxEvent::Samples(&chunk)).is_break() {
                break;
            }
            if self.config.realtime && cancel.wait_timeout(chunk_period) {
                break;
            }
        }

        Ok(acquisition)
    }

    fn supported_sample_rates(&self) -> Option<Vec<f64>> {
        if self.config.sample_rates.is_empty() {
            return None;
        }
        let mut rates = self.config.sample_rates.clone();
        rates.sort_by(f64::total_cmp);
        rates.dedup();
        Some(rates)
    }
}

impl ComponentLogger for SimulatedDevice {
    fn log_context(&self) -> LogContext {
        LogContext::new("SimulatedDevice", "sim:0")
    }
}

/// Narrowband tone at `normalized_freq` cycles/sample plus complex gaussian
/// noise of standard deviation `noise_amplitude` per component.
pub fn tone_with_noise<R: Rng>(
    num_samples: usize,
    normalized_freq: f32,
    start_index: u64,
    noise_amplitude: f32,
    rng: &mut R,
) -> Vec<Sample> {
    let step = 2.0 * std::f64::consts::PI * normalized_freq as f64;
    (0..num_samples)
        .map(|i| {
            let phase = step * (start_index + i as u64) as f64;
            let tone = Sample::new(phase.cos() as f32, phase.sin() as f32);
            let (re, im) = gaussian_pair(rng);
            tone + Sample::new(re * noise_amplitude, im * noise_amplitude)
        })
        .collect()
}

// Box-Muller
fn gaussian_pair<R: Rng>(rng: &mut R) -> (f32, f32) {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.r#gen();
    let radius = (-2.0 * u1.ln()).sqrt();
    let theta = 2.0 * std::f32::consts::PI * u2;
    (radius * theta.cos(), radius * theta.sin())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rx(rate: f64) -> RxSettings {
        RxSettings {
            freq: 100e6,
            rate,
            gain: 20.0,
            channel: 0,
            bandwidth: None,
        }
    }

    #[test]
    fn test_rate_snaps_to_closest_supported() {
        let device = SimulatedDevice::default();
        assert_eq!(device.configure_rx(&rx(1.9e6)).unwrap(), 2e6);
        assert_eq!(device.configure_rx(&rx(300e3)).unwrap(), 250e3);
    }

    #[test]
    fn test_record_produces_requested_duration() {
        let device = SimulatedDevice::default();
        device.configure_rx(&rx(1e6)).unwrap();

        let mut chunks = 0;
        let acquisition = device
            .record_samples(
                0.01,
                0,
                &mut |event| {
                    if let RxEvent::Samples(_) = event {
                        chunks += 1;
                    }
                    ControlFlow::Continue(())
                },
                &CancelToken::new(),
                true,
            )
            .unwrap();

        assert_eq!(acquisition.samples.len(), 10_000);
        assert_eq!(chunks, 3);
        assert_eq!(acquisition.overflow_count, 0);
    }

    #[test]
    fn test_disconnected_device_refuses_tuning() {
        let device = SimulatedDevice::default();
        device.disconnect();
        assert!(!device.is_connected());
        assert!(device.configure_rx(&rx(1e6)).is_err());
    }

    #[test]
    fn test_tone_with_noise_length() {
        let mut rng = rand::thread_rng();
        let samples = tone_with_noise(128, 0.1, 0, 0.0, &mut rng);
        assert_eq!(samples.len(), 128);
        assert!((samples[0].re - 1.0).abs() < 1e-6);
    }
}
